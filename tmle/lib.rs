#![deny(dead_code)]
#![deny(unused_imports)]

pub mod bounds;
pub mod config;
pub mod data;
pub mod design;
pub mod ensemble;
pub mod estimate;
pub mod fluctuation;
pub mod glm;
pub mod hazard;
pub mod influence;
pub mod linalg;
pub mod mean;
pub mod nuisance;
pub mod projection;

pub use config::RunConfig;
pub use estimate::{EstimateRecord, EstimationOptions, FitBundle, Method, NuisanceSpecs, TmleFit, estimate};
pub use projection::{IncidenceCurve, project};
