#![allow(dead_code)]

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};
use survtmle::data::ObservedData;
use survtmle::design::Term;
use survtmle::estimate::NuisanceSpecs;
use survtmle::nuisance::{EstimatorSpec, ParametricSpec};

/// Discrete-time competing-risks data-generating process with one covariate.
#[derive(Debug, Clone, Copy)]
pub struct Scenario {
    /// Per-time probability of censoring among subjects still event-free.
    pub censoring: f64,
    /// Last time point simulated; survivors are event-free at `max_time`.
    pub max_time: u32,
}

impl Scenario {
    pub fn uncensored(max_time: u32) -> Self {
        Self {
            censoring: 0.0,
            max_time,
        }
    }
}

fn expit(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

pub fn propensity(w: f64) -> f64 {
    expit(0.3 * w)
}

/// Cause-specific hazards `(h1, h2)` at any time.
pub fn hazards(arm: u8, w: f64) -> (f64, f64) {
    let a = f64::from(arm);
    (expit(-2.2 + 0.6 * a + 0.5 * w), expit(-2.6 - 0.4 * a))
}

pub fn simulate(n: usize, scenario: Scenario, seed: u64) -> ObservedData {
    let mut rng = StdRng::seed_from_u64(seed);
    let covariate = Uniform::new(-1.0, 1.0);
    let (mut ftime, mut ftype, mut trt, mut w) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
    for _ in 0..n {
        let wi: f64 = covariate.sample(&mut rng);
        let arm = u8::from(rng.gen_bool(propensity(wi)));
        let (h1, h2) = hazards(arm, wi);
        let mut t = 1;
        let kind = loop {
            let u: f64 = rng.gen_range(0.0..1.0);
            if u < h1 {
                break 1;
            }
            if u < h1 + h2 {
                break 2;
            }
            if t == scenario.max_time || rng.gen_bool(scenario.censoring) {
                break 0;
            }
            t += 1;
        };
        ftime.push(i64::from(t));
        ftype.push(kind);
        trt.push(i64::from(arm));
        w.push(wi);
    }
    ObservedData::new(
        None,
        &ftime,
        &ftype,
        &trt,
        Array2::from_shape_vec((n, 1), w).expect("covariate matrix"),
        vec!["W1".into()],
    )
    .expect("simulated data are valid")
}

/// A single failure type with the type-1 hazard of [`hazards`], no censoring, and
/// follow-up to `max_time`.
pub fn simulate_single_type(n: usize, max_time: u32, seed: u64) -> ObservedData {
    let mut rng = StdRng::seed_from_u64(seed);
    let covariate = Uniform::new(-1.0, 1.0);
    let (mut ftime, mut ftype, mut trt, mut w) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
    for _ in 0..n {
        let wi: f64 = covariate.sample(&mut rng);
        let arm = u8::from(rng.gen_bool(propensity(wi)));
        let (h1, _) = hazards(arm, wi);
        let mut t = 1;
        let kind = loop {
            if rng.gen_bool(h1) {
                break 1;
            }
            if t == max_time {
                break 0;
            }
            t += 1;
        };
        ftime.push(i64::from(t));
        ftype.push(kind);
        trt.push(i64::from(arm));
        w.push(wi);
    }
    ObservedData::new(
        None,
        &ftime,
        &ftype,
        &trt,
        Array2::from_shape_vec((n, 1), w).expect("covariate matrix"),
        vec!["W1".into()],
    )
    .expect("simulated data are valid")
}

/// `E_W F_k(horizon | a, W)`, averaged over a fine grid of the uniform covariate.
pub fn true_incidence(arm: u8, ftype: u8, horizon: u32) -> f64 {
    let grid = 2000;
    (0..grid)
        .map(|g| {
            let w = -1.0 + 2.0 * (g as f64 + 0.5) / grid as f64;
            let (h1, h2) = hazards(arm, w);
            let hk = if ftype == 1 { h1 } else { h2 };
            let mut survival = 1.0;
            let mut incidence = 0.0;
            for _ in 0..horizon {
                incidence += hk * survival;
                survival *= 1.0 - h1 - h2;
            }
            incidence
        })
        .sum::<f64>()
        / grid as f64
}

pub fn parametric(terms: &[&str]) -> EstimatorSpec {
    EstimatorSpec::Parametric(ParametricSpec::new(
        terms.iter().map(|t| t.parse::<Term>().expect("term")).collect(),
    ))
}

/// Correctly specified nuisance models for [`simulate`].
pub fn correct_specs() -> NuisanceSpecs {
    NuisanceSpecs {
        treatment: parametric(&["W1"]),
        censoring: parametric(&["trt", "W1"]),
        failure: parametric(&["trt", "W1", "factor(t)"]),
    }
}
