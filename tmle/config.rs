//! Run configuration in a human-readable TOML format.
//!
//! ```toml
//! method = "hazard"
//! horizon = 6
//! failure_types = [1]
//!
//! [hazard]
//! max_iter = 20
//!
//! [models.treatment.parametric]
//! terms = ["W1"]
//! [models.censoring.parametric]
//! terms = ["trt", "factor(t)"]
//! [models.failure.parametric]
//! terms = ["trt", "factor(t)", "W1"]
//! ```

use crate::bounds::Bounds;
use crate::estimate::{EstimationOptions, Method, NuisanceSpecs};
use crate::hazard::HazardTmleConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Everything an estimation run needs besides the data and the bounds table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub method: Method,
    pub horizon: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_types: Option<Vec<u8>>,
    #[serde(default = "default_arms")]
    pub arms: Vec<u8>,
    #[serde(default)]
    pub hazard: HazardTmleConfig,
    #[serde(default = "default_g_truncation")]
    pub g_truncation: f64,
    #[serde(default = "default_confidence_level")]
    pub confidence_level: f64,
    #[serde(default)]
    pub gcomp: bool,
    #[serde(default)]
    pub models: NuisanceSpecs,
}

fn default_arms() -> Vec<u8> {
    vec![0, 1]
}

fn default_g_truncation() -> f64 {
    1e-3
}

fn default_confidence_level() -> f64 {
    0.95
}

impl RunConfig {
    pub fn new(method: Method, horizon: u32) -> Self {
        Self {
            method,
            horizon,
            failure_types: None,
            arms: default_arms(),
            hazard: HazardTmleConfig::default(),
            g_truncation: default_g_truncation(),
            confidence_level: default_confidence_level(),
            gcomp: false,
            models: NuisanceSpecs::default(),
        }
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        log::info!("Loaded run configuration from {path}");
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Options for [`crate::estimate::estimate`] at the configured horizon.
    pub fn options(&self, bounds: Option<Bounds>, return_fits: bool) -> EstimationOptions {
        EstimationOptions {
            method: self.method,
            horizon: self.horizon,
            failure_types: self.failure_types.clone(),
            arms: self.arms.clone(),
            bounds,
            hazard: self.hazard,
            g_truncation: self.g_truncation,
            confidence_level: self.confidence_level,
            gcomp: self.gcomp,
            return_fits,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::design::Term;
    use crate::nuisance::{EstimatorSpec, ParametricSpec};
    use tempfile::NamedTempFile;

    #[test]
    fn minimal_config_takes_defaults() {
        let config: RunConfig = toml::from_str("horizon = 4").unwrap();
        assert_eq!(config, RunConfig::new(Method::Hazard, 4));
        let options = config.options(None, false);
        assert_eq!(options, EstimationOptions::new(Method::Hazard, 4));
    }

    #[test]
    fn parses_models_and_ensembles() {
        let text = r#"
method = "mean"
horizon = 5
failure_types = [1, 2]
g_truncation = 0.01

[hazard]
tol = 1e-4
max_iter = 25

[models.treatment.parametric]
terms = ["W1"]

[models.censoring.parametric]
terms = ["trt", "factor(t)"]

[models.failure.ensemble]
folds = 5
seed = 3
combiner = "discrete"

[[models.failure.ensemble.candidates]]
name = "mean"
learner = { kind = "mean" }

[[models.failure.ensemble.candidates]]
name = "glm"
learner = { kind = "glm", terms = ["trt", "trt:W1"] }
"#;
        let config: RunConfig = toml::from_str(text).unwrap();
        assert_eq!(config.method, Method::Mean);
        assert_eq!(config.hazard.tol, Some(1e-4));
        assert_eq!(config.hazard.max_iter, 25);
        assert_eq!(
            config.models.treatment,
            EstimatorSpec::Parametric(ParametricSpec::new(vec![Term::Covariate("W1".into())]))
        );
        match &config.models.failure {
            EstimatorSpec::Ensemble(spec) => {
                assert_eq!(spec.candidate_names(), vec!["mean", "glm"]);
                assert!(spec.uses_treatment());
            }
            other => panic!("expected an ensemble, got {other:?}"),
        }
    }

    #[test]
    fn invalid_ensemble_is_a_parse_error() {
        let text = r#"
horizon = 2
[models.treatment.parametric]
[models.censoring.parametric]
[models.failure.ensemble]
folds = 1
[[models.failure.ensemble.candidates]]
name = "mean"
learner = { kind = "mean" }
"#;
        assert!(toml::from_str::<RunConfig>(text).is_err());
    }

    #[test]
    fn save_then_load() {
        let mut config = RunConfig::new(Method::Mean, 3);
        config.failure_types = Some(vec![2]);
        config.hazard.tol = Some(0.001);
        let file = NamedTempFile::new().unwrap();
        let path = file.path().to_str().unwrap();
        config.save(path).unwrap();
        assert_eq!(RunConfig::load(path).unwrap(), config);
    }
}
