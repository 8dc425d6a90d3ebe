//! # Efficient Influence Curve
//!
//! For a target `(a, k)` at horizon `t0` the efficient influence curve of the
//! cumulative incidence `F_k(t0 | a)` is, per observation,
//!
//! ```text
//! D_i = sum_{t <= min(ftime_i, t0)} I(A_i = a) / (g(a|W_i) G(t-1|a,W_i)) R_{i,t}
//!       + P_{a,k}(W_i) - psi_{a,k}
//! ```
//!
//! where the residual `R` and the plug-in `P` depend on the estimation method. The
//! hazard form is computed here from incidence curves; the iterated-mean form is
//! accumulated time point by time point inside the backward recursion and finished
//! with [`finish_eic`].
//!
//! The mean of `D` is the first-order bias that targeting removes; `var(D) / n` is
//! the variance of the estimator.

use crate::data::ObservedData;
use crate::projection::IncidenceCurves;
use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A clone-specific target: the cumulative incidence of `ftype` had everybody
/// received treatment `arm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target {
    pub arm: u8,
    pub ftype: u8,
}

impl Target {
    pub fn new(arm: u8, ftype: u8) -> Self {
        Self { arm, ftype }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "F{}(trt={})", self.ftype, self.arm)
    }
}

/// Inverse probability weights `1 / (g(a|W) G(t-1|a,W))` for one treatment arm.
#[derive(Debug, Clone)]
pub struct InverseWeights {
    propensity: Array1<f64>,
    /// `G(t | a, W_i)` for `t = 0..=t0`; column 0 is one.
    censoring_survival: Array2<f64>,
    floor: f64,
}

impl InverseWeights {
    /// `propensity` is bounded below by `floor` and so is the product `g G`.
    pub fn new(propensity: Array1<f64>, censoring_survival: Array2<f64>, floor: f64) -> Self {
        Self {
            propensity: propensity.mapv(|g| g.max(floor)),
            censoring_survival,
            floor,
        }
    }

    pub fn propensity(&self) -> ArrayView1<'_, f64> {
        self.propensity.view()
    }

    /// Censoring survival `G(time | a, W_subject)`.
    #[inline]
    pub fn censoring_survival(&self, subject: usize, time: u32) -> f64 {
        self.censoring_survival[[subject, time as usize]]
    }

    /// Weight of `subject`'s pooled row at `time >= 1`.
    #[inline]
    pub fn weight(&self, subject: usize, time: u32) -> f64 {
        let denominator =
            self.propensity[subject] * self.censoring_survival[[subject, time as usize - 1]];
        1.0 / denominator.max(self.floor)
    }
}

/// Weights for both treatment arms, indexed by the arm value.
#[derive(Debug, Clone)]
pub struct ArmWeights {
    arms: [InverseWeights; 2],
}

impl ArmWeights {
    pub fn new(control: InverseWeights, treated: InverseWeights) -> Self {
        Self {
            arms: [control, treated],
        }
    }

    #[inline]
    pub fn arm(&self, arm: u8) -> &InverseWeights {
        &self.arms[usize::from(arm)]
    }

    #[inline]
    pub fn weight(&self, arm: u8, subject: usize, time: u32) -> f64 {
        self.arm(arm).weight(subject, time)
    }
}

/// Hazard-form clever covariate for hazard `hazard_idx` and target type `target_idx`:
/// `I(j = k) - (F_k(t0) - F_k(t)) / S(t)`, without the inverse weight.
#[inline]
pub fn hazard_clever_covariate(
    curves: &IncidenceCurves,
    subject: usize,
    time: u32,
    hazard_idx: usize,
    target_idx: usize,
) -> f64 {
    let t = time as usize;
    let horizon = curves.horizon() as usize;
    let survival = curves.survival[[subject, t]];
    let incidence = &curves.incidence[target_idx];
    let remaining = if survival > 0.0 {
        (incidence[[subject, horizon]] - incidence[[subject, t]]) / survival
    } else {
        0.0
    };
    let indicator = if hazard_idx == target_idx { 1.0 } else { 0.0 };
    indicator - remaining
}

/// Hazard-form influence curve for the incidence of `types[target_idx]` under `arm`,
/// evaluated on that arm's incidence curves. `types` lists the failure types in the
/// order of `curves.hazards`. Returns the plug-in estimate and the per-observation
/// influence curve.
pub fn hazard_eic(
    data: &ObservedData,
    arm: u8,
    target_idx: usize,
    types: &[u8],
    curves: &IncidenceCurves,
    weights: &InverseWeights,
) -> (f64, Array1<f64>) {
    let horizon = curves.horizon();
    let plug_in = curves.incidence_at_horizon(target_idx);
    let martingale: Array1<f64> = (0..data.n())
        .map(|i| {
            if data.trt[i] != arm {
                return 0.0;
            }
            let mut sum = 0.0;
            for t in 1..=data.last_observed(i, horizon) {
                let w = weights.weight(i, t);
                for (j_idx, &j) in types.iter().enumerate() {
                    let h = hazard_clever_covariate(curves, i, t, j_idx, target_idx);
                    let event = if data.failed_at(i, t, j) { 1.0 } else { 0.0 };
                    sum += w * h * (event - curves.hazards[j_idx][[i, t as usize - 1]]);
                }
            }
            sum
        })
        .collect();
    finish_eic(martingale, plug_in.view())
}

/// Adds the centred plug-in term to an accumulated weighted residual sum.
pub fn finish_eic(martingale: Array1<f64>, plug_in: ArrayView1<f64>) -> (f64, Array1<f64>) {
    let psi = plug_in.mean().unwrap_or(0.0);
    let eic = martingale + &plug_in.mapv(|p| p - psi);
    (psi, eic)
}

/// Mean, variance and standard error of an estimator with influence curve `eic`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EicSummary {
    pub mean: f64,
    pub variance: f64,
    pub std_error: f64,
}

pub fn summarize(eic: ArrayView1<f64>) -> EicSummary {
    let n = eic.len().max(1) as f64;
    let mean = eic.sum() / n;
    let variance = eic.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / (n * n);
    EicSummary {
        mean,
        variance,
        std_error: variance.sqrt(),
    }
}

/// Empirical covariance of the influence curves divided by `n`, so the diagonal
/// matches [`summarize`].
pub fn covariance(eics: &[ArrayView1<f64>]) -> Array2<f64> {
    let q = eics.len();
    let n = eics.first().map_or(1, |e| e.len().max(1)) as f64;
    let centered: Vec<Array1<f64>> = eics
        .iter()
        .map(|e| {
            let mean = e.sum() / n;
            e.mapv(|d| d - mean)
        })
        .collect();
    Array2::from_shape_fn((q, q), |(r, c)| centered[r].dot(&centered[c]) / (n * n))
}
