//! Cumulative incidence curves.
//!
//! Discrete hazards are aggregated by the product-limit formulas
//!
//! ```text
//! S(t)   = prod_{s <= t} (1 - sum_j h_j(s))
//! F_k(t) = sum_{s <= t} h_k(s) S(s - 1)
//! ```
//!
//! and a fitted estimation run is re-evaluated over a set of horizons with
//! [`project`], optionally followed by an isotonic (pool-adjacent-violators)
//! regression so the reported curve is non-decreasing.

use crate::estimate::{FitBundle, TmleError};
use crate::influence::{Target, summarize};
use ndarray::{Array1, Array2};
use serde::Serialize;

/// Per-subject survival and incidence curves for one treatment arm.
#[derive(Debug, Clone)]
pub struct IncidenceCurves {
    /// Hazards per failure type, `n x t0`, column `t - 1` holds time `t`.
    pub hazards: Vec<Array2<f64>>,
    /// `n x (t0 + 1)`, column 0 is one.
    pub survival: Array2<f64>,
    /// Per failure type, `n x (t0 + 1)`, column 0 is zero.
    pub incidence: Vec<Array2<f64>>,
}

impl IncidenceCurves {
    /// Aggregates hazards that already satisfy `sum_j h_j(t) <= 1`.
    pub fn from_hazards(hazards: &[Array2<f64>]) -> Self {
        let (n, horizon) = hazards.first().map_or((0, 0), |h| h.dim());
        let mut survival = Array2::<f64>::zeros((n, horizon + 1));
        let mut incidence = vec![Array2::<f64>::zeros((n, horizon + 1)); hazards.len()];
        for i in 0..n {
            survival[[i, 0]] = 1.0;
            for t in 1..=horizon {
                let previous = survival[[i, t - 1]];
                let mut total = 0.0;
                for (k, h) in hazards.iter().enumerate() {
                    let hk = h[[i, t - 1]];
                    total += hk;
                    incidence[k][[i, t]] = incidence[k][[i, t - 1]] + hk * previous;
                }
                survival[[i, t]] = previous * (1.0 - total);
            }
        }
        Self {
            hazards: hazards.to_vec(),
            survival,
            incidence,
        }
    }

    pub fn horizon(&self) -> u32 {
        (self.survival.ncols().saturating_sub(1)) as u32
    }

    /// `F_k(t0 | W_i)` for every subject.
    pub fn incidence_at_horizon(&self, type_idx: usize) -> Array1<f64> {
        let horizon = self.horizon() as usize;
        self.incidence[type_idx].column(horizon).to_owned()
    }
}

/// Pool-adjacent-violators: the least-squares non-decreasing fit to `values`.
pub fn isotonic(values: &[f64]) -> Vec<f64> {
    // Blocks of (mean, size).
    let mut blocks: Vec<(f64, usize)> = Vec::with_capacity(values.len());
    for &v in values {
        blocks.push((v, 1));
        while blocks.len() > 1 {
            let (last_mean, last_size) = blocks[blocks.len() - 1];
            let (prev_mean, prev_size) = blocks[blocks.len() - 2];
            if prev_mean <= last_mean {
                break;
            }
            blocks.pop();
            blocks.pop();
            let size = prev_size + last_size;
            let mean = (prev_mean * prev_size as f64 + last_mean * last_size as f64) / size as f64;
            blocks.push((mean, size));
        }
    }
    blocks
        .into_iter()
        .flat_map(|(mean, size)| std::iter::repeat_n(mean, size))
        .collect()
}

/// Estimates of one target across horizons.
#[derive(Debug, Clone, Serialize)]
pub struct IncidenceCurve {
    pub target: Target,
    pub horizons: Vec<u32>,
    pub estimates: Vec<f64>,
    pub std_errors: Vec<f64>,
    /// Non-decreasing projection of `estimates`, when requested.
    pub isotonic: Option<Vec<f64>>,
}

/// Re-runs the targeting of a fitted bundle at every horizon in `horizons`, reusing
/// its frozen treatment, censoring and hazard fits. Horizons are sorted and must
/// lie in `1..=t0` of the bundle.
pub fn project(
    bundle: &FitBundle,
    horizons: &[u32],
    isotonic_fit: bool,
) -> Result<Vec<IncidenceCurve>, TmleError> {
    let mut horizons = horizons.to_vec();
    horizons.sort_unstable();
    horizons.dedup();
    if horizons.is_empty() {
        return Err(TmleError::Projection("no horizons were requested".to_string()));
    }
    if let Some(&bad) = horizons
        .iter()
        .find(|&&h| h == 0 || h > bundle.horizon())
    {
        return Err(TmleError::Projection(format!(
            "horizon {bad} is outside 1..={}",
            bundle.horizon()
        )));
    }

    let mut curves: Vec<IncidenceCurve> = bundle
        .targets()
        .iter()
        .map(|&target| IncidenceCurve {
            target,
            horizons: horizons.clone(),
            estimates: Vec::with_capacity(horizons.len()),
            std_errors: Vec::with_capacity(horizons.len()),
            isotonic: None,
        })
        .collect();

    for &horizon in &horizons {
        log::info!("Projecting cumulative incidence at t={horizon}");
        let estimates = bundle.target_at(horizon)?;
        for (curve, estimate) in curves.iter_mut().zip(estimates) {
            curve.estimates.push(estimate.estimate);
            curve.std_errors.push(summarize(estimate.eic.view()).std_error);
        }
    }

    if isotonic_fit {
        for curve in &mut curves {
            curve.isotonic = Some(isotonic(&curve.estimates));
        }
    }
    Ok(curves)
}
