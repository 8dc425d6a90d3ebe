//! # Hazard-Based TMLE
//!
//! One pooled logistic model is fitted per observed failure type. The fitted
//! hazards are then updated jointly for every target by an iterative offset
//! logistic fluctuation on the stacked pooled rows of all hazard types, until the
//! mean efficient influence curve of every target is below the tolerance or the
//! iteration limit is reached.
//!
//! All updates happen on the logit of the bounded-unit-scale hazard; the frozen
//! initial fits are never touched, so [`HazardProblem::target`] can be rerun at any
//! horizon up to the one the models were fitted for.

use crate::bounds::Bounds;
use crate::data::{InputError, ObservedData};
use crate::design::{DesignRow, pooled_rows};
use crate::fluctuation::{Fluctuation, FluctuationDiagnostic, fit_fluctuation};
use crate::glm::{expit, logit};
use crate::influence::{ArmWeights, Target, hazard_clever_covariate, hazard_eic};
use crate::nuisance::{EstimatorSpec, FitError, FittedModel, NuisanceEstimator};
use crate::projection::IncidenceCurves;
use ndarray::{Array1, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Hazards are clipped to `[0, 1 - HAZARD_CLIP_EPS]` and their sum at a time point
/// may not exceed `1 - HAZARD_CLIP_EPS`.
pub const HAZARD_CLIP_EPS: f64 = 1e-8;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HazardTmleConfig {
    /// Convergence tolerance on `max |mean EIC|`; `1 / n` when absent.
    pub tol: Option<f64>,
    pub max_iter: usize,
}

impl Default for HazardTmleConfig {
    fn default() -> Self {
        Self {
            tol: None,
            max_iter: 10,
        }
    }
}

/// Outcome of the targeting loop. The loop exits when every mean EIC is below
/// the tolerance (`converged`) or after `max_iter` fluctuations. A joint fluctuation
/// that cannot be fitted at all also ends the loop, earlier and with
/// `converged = false`; the reason is then among the diagnostics of the result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Convergence {
    pub iterations: usize,
    pub converged: bool,
    /// Largest absolute mean EIC across targets at exit.
    pub max_abs_mean_eic: f64,
}

/// Frozen pooled hazard fits, one per observed failure type.
#[derive(Debug, Clone)]
pub struct HazardFits {
    pub types: Vec<u8>,
    pub models: Vec<FittedModel>,
}

impl HazardFits {
    fn type_index(&self, ftype: u8) -> Result<usize, InputError> {
        self.types
            .iter()
            .position(|&j| j == ftype)
            .ok_or(InputError::UnobservedFailureType(ftype))
    }
}

/// Fits `P(dN_j(t) = 1 | at risk at t, A, W)` on the pooled rows up to `horizon`
/// for every observed failure type `j`. Under bounds the outcome is mapped onto the
/// unit scale of `(t, j)` before fitting.
pub fn fit_hazards(
    data: &ObservedData,
    horizon: u32,
    spec: &EstimatorSpec,
    bounds: &Bounds,
) -> Result<HazardFits, FitError> {
    let rows = pooled_rows(data, horizon);
    let types = data.failure_types();
    log::info!(
        "Fitting {} cause-specific hazard model(s) with {} on {} pooled rows",
        types.len(),
        spec.describe(),
        rows.len()
    );
    let models = types
        .par_iter()
        .map(|&j| {
            let outcome: Array1<f64> = rows
                .iter()
                .map(|r| {
                    let event = if data.failed_at(r.subject, r.time, j) { 1.0 } else { 0.0 };
                    bounds.scale(r.time, j).to_unit(event)
                })
                .collect();
            spec.fit(data, &rows, outcome.view())
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(HazardFits { types, models })
}

/// The working logit-scale hazards of one counterfactual arm.
#[derive(Debug, Clone)]
struct ArmState {
    arm: u8,
    /// Per failure type, `n x t0`, logit of the unit-scale hazard.
    logits: Vec<Array2<f64>>,
}

impl ArmState {
    fn initial(
        data: &ObservedData,
        horizon: u32,
        fits: &HazardFits,
        arm: u8,
    ) -> Result<Self, FitError> {
        let n = data.n();
        let h = horizon as usize;
        let rows: Vec<DesignRow> = (0..n)
            .flat_map(|i| (1..=horizon).map(move |t| DesignRow::new(i, t, arm)))
            .collect();
        let logits = fits
            .models
            .iter()
            .map(|model| {
                let predicted = model.predict(data, &rows)?;
                Ok(Array2::from_shape_fn((n, h), |(i, c)| {
                    logit(predicted[i * h + c])
                }))
            })
            .collect::<Result<Vec<_>, FitError>>()?;
        Ok(Self { arm, logits })
    }

    /// Hazards on the probability scale, clipped and rescaled so that every
    /// time point leaves a positive probability of surviving.
    fn hazards(&self, types: &[u8], bounds: &Bounds) -> Vec<Array2<f64>> {
        let mut hazards: Vec<Array2<f64>> = self
            .logits
            .iter()
            .zip(types)
            .map(|(logits, &j)| {
                let mut hz = logits.mapv(expit);
                for (c, mut column) in hz.columns_mut().into_iter().enumerate() {
                    let scale = bounds.scale(c as u32 + 1, j);
                    column.mapv_inplace(|u| scale.from_unit(u).clamp(0.0, 1.0 - HAZARD_CLIP_EPS));
                }
                hz
            })
            .collect();
        let Some((n, h)) = hazards.first().map(|a| a.dim()) else {
            return hazards;
        };
        for i in 0..n {
            for c in 0..h {
                let total: f64 = hazards.iter().map(|hz| hz[[i, c]]).sum();
                if total > 1.0 - HAZARD_CLIP_EPS {
                    let factor = (1.0 - HAZARD_CLIP_EPS) / total;
                    for hz in hazards.iter_mut() {
                        hz[[i, c]] *= factor;
                    }
                }
            }
        }
        hazards
    }
}

/// Targeted estimates at one horizon.
#[derive(Debug, Clone)]
pub struct HazardTmleResult {
    pub targets: Vec<Target>,
    pub estimates: Vec<f64>,
    pub eics: Vec<Array1<f64>>,
    /// `None` when targeting was skipped.
    pub convergence: Option<Convergence>,
    pub diagnostics: Vec<FluctuationDiagnostic>,
    /// Final hazards per target arm (in order of first appearance in `targets`),
    /// each a vector over failure types of `n x t0` matrices.
    pub hazards: Vec<(u8, Vec<Array2<f64>>)>,
}

/// Everything the targeting loop reads but never changes.
pub struct HazardProblem<'a> {
    pub data: &'a ObservedData,
    pub horizon: u32,
    pub fits: &'a HazardFits,
    pub weights: &'a ArmWeights,
    pub bounds: &'a Bounds,
    pub config: &'a HazardTmleConfig,
}

/// Position of a target's arm in the state vector and of its type in `fits.types`.
#[derive(Debug, Clone, Copy)]
struct TargetIndex {
    arm_pos: usize,
    type_idx: usize,
}

impl HazardProblem<'_> {
    /// Runs the targeting loop for `targets`. With `targeting = false` the
    /// initial plug-in estimates are returned.
    pub fn target(&self, targets: &[Target], targeting: bool) -> Result<HazardTmleResult, FitError> {
        let data = self.data;
        let n = data.n();
        let tol = self.config.tol.unwrap_or(1.0 / n.max(1) as f64);

        let mut arms: Vec<u8> = Vec::new();
        for target in targets {
            if !arms.contains(&target.arm) {
                arms.push(target.arm);
            }
        }
        let index: Vec<TargetIndex> = targets
            .iter()
            .map(|target| {
                Ok(TargetIndex {
                    arm_pos: arms.iter().position(|&a| a == target.arm).unwrap_or(0),
                    type_idx: self.fits.type_index(target.ftype)?,
                })
            })
            .collect::<Result<_, InputError>>()?;

        let mut states: Vec<ArmState> = arms
            .iter()
            .map(|&a| ArmState::initial(data, self.horizon, self.fits, a))
            .collect::<Result<_, _>>()?;

        let mut iterations = 0;
        let mut diagnostics = Vec::new();
        loop {
            let curves: Vec<IncidenceCurves> = states
                .iter()
                .map(|s| IncidenceCurves::from_hazards(&s.hazards(&self.fits.types, self.bounds)))
                .collect();
            let (estimates, eics): (Vec<f64>, Vec<Array1<f64>>) = index
                .iter()
                .map(|ix| {
                    let arm = states[ix.arm_pos].arm;
                    hazard_eic(
                        data,
                        arm,
                        ix.type_idx,
                        &self.fits.types,
                        &curves[ix.arm_pos],
                        self.weights.arm(arm),
                    )
                })
                .unzip();
            let worst = eics
                .iter()
                .map(|eic| eic.mean().unwrap_or(0.0).abs())
                .fold(0.0, f64::max);
            log::debug!("Hazard targeting iteration {iterations}: max |mean EIC| = {worst:.3e}");

            let stop = if !targeting {
                Some(None)
            } else if worst < tol {
                Some(Some(true))
            } else if iterations >= self.config.max_iter {
                log::warn!(
                    "Hazard targeting stopped after {iterations} iterations with max |mean EIC| = {worst:.3e} (tolerance {tol:.3e})"
                );
                Some(Some(false))
            } else {
                match self.fluctuate(targets, &index, &mut states, &curves) {
                    Ok(fluctuation) => {
                        if let Some(diagnostic) =
                            fluctuation.convergence_diagnostic(None, Some(iterations))
                        {
                            log::warn!("Hazard targeting: {diagnostic}");
                            diagnostics.push(diagnostic);
                        }
                        None
                    }
                    Err(diagnostic) => {
                        log::warn!("Hazard targeting stopped: {diagnostic}");
                        diagnostics.push(diagnostic);
                        Some(Some(false))
                    }
                }
            };

            if let Some(converged) = stop {
                let hazards = states
                    .iter()
                    .zip(&curves)
                    .map(|(s, c)| (s.arm, c.hazards.clone()))
                    .collect();
                return Ok(HazardTmleResult {
                    targets: targets.to_vec(),
                    estimates,
                    eics,
                    convergence: converged.map(|converged| Convergence {
                        iterations,
                        converged,
                        max_abs_mean_eic: worst,
                    }),
                    diagnostics,
                    hazards,
                });
            }
            iterations += 1;
        }
    }

    /// One joint fluctuation of all hazards for all targets. Column `j * Q + q`
    /// carries the clever covariate of hazard type `j` for target `q`.
    fn fluctuate(
        &self,
        targets: &[Target],
        index: &[TargetIndex],
        states: &mut [ArmState],
        curves: &[IncidenceCurves],
    ) -> Result<Fluctuation, FluctuationDiagnostic> {
        let data = self.data;
        let types = &self.fits.types;
        let q = targets.len();
        let ncols = types.len() * q;
        let arm_pos = |arm: u8| states.iter().position(|s| s.arm == arm);

        let subjects: Vec<(usize, usize)> = (0..data.n())
            .filter_map(|i| arm_pos(data.trt[i]).map(|p| (i, p)))
            .collect();
        let per_type: usize = subjects
            .iter()
            .map(|&(i, _)| data.last_observed(i, self.horizon) as usize)
            .sum();
        let nrows = per_type * types.len();

        let mut clever = Array2::<f64>::zeros((nrows, ncols));
        let mut outcome = Array1::<f64>::zeros(nrows);
        let mut offset = Array1::<f64>::zeros(nrows);
        let mut row = 0;
        for (j_idx, &j) in types.iter().enumerate() {
            for &(i, p) in &subjects {
                let arm = states[p].arm;
                for t in 1..=data.last_observed(i, self.horizon) {
                    let scale = self.bounds.scale(t, j);
                    let event = if data.failed_at(i, t, j) { 1.0 } else { 0.0 };
                    outcome[row] = scale.to_unit(event);
                    offset[row] = states[p].logits[j_idx][[i, t as usize - 1]];
                    let w = self.weights.weight(arm, i, t) * scale.width();
                    for (col, ix) in index.iter().enumerate() {
                        if ix.arm_pos == p {
                            clever[[row, j_idx * q + col]] =
                                w * hazard_clever_covariate(&curves[p], i, t, j_idx, ix.type_idx);
                        }
                    }
                    row += 1;
                }
            }
        }

        let fluctuation = fit_fluctuation(clever.view(), outcome.view(), offset.view()).map_err(
            |e| FluctuationDiagnostic::FitFailed {
                time: None,
                iteration: None,
                message: e.to_string(),
            },
        )?;
        if fluctuation.degenerate_columns.len() == ncols {
            return Err(FluctuationDiagnostic::ZeroCleverCovariate {
                time: None,
                arm: targets.first().map_or(0, |t| t.arm),
            });
        }
        log::debug!("Hazard fluctuation coefficients: {:?}", fluctuation.epsilon.to_vec());

        let n = data.n();
        for (p, state) in states.iter_mut().enumerate() {
            let arm = state.arm;
            for (j_idx, &j) in types.iter().enumerate() {
                let logits = &mut state.logits[j_idx];
                for i in 0..n {
                    for t in 1..=self.horizon {
                        let w = self.weights.weight(arm, i, t) * self.bounds.scale(t, j).width();
                        let shift: f64 = index
                            .iter()
                            .enumerate()
                            .filter(|(_, ix)| ix.arm_pos == p)
                            .map(|(col, ix)| {
                                fluctuation.epsilon[j_idx * q + col]
                                    * hazard_clever_covariate(&curves[p], i, t, j_idx, ix.type_idx)
                            })
                            .sum();
                        logits[[i, t as usize - 1]] += w * shift;
                    }
                }
            }
        }
        Ok(fluctuation)
    }
}
