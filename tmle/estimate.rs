//! # Estimation Orchestrator
//!
//! [`estimate`] validates the request, fits the nuisance models shared by both
//! methods (treatment and censoring), fits the method-specific outcome models and
//! targets every `(arm, failure type)` combination at the horizon. The frozen fits
//! are kept in a [`FitBundle`] so the same run can be re-evaluated at earlier
//! horizons by [`crate::projection::project`].

use crate::bounds::Bounds;
use crate::data::{InputError, ObservedData, TimeGrid};
use crate::design::{DesignRow, Term, pooled_rows};
use crate::fluctuation::FluctuationDiagnostic;
use crate::hazard::{Convergence, HazardFits, HazardProblem, HazardTmleConfig, fit_hazards};
use crate::influence::{ArmWeights, InverseWeights, Target, covariance, summarize};
use crate::mean::MeanProblem;
use crate::nuisance::{EstimatorSpec, FitError, FittedModel, NuisanceEstimator, ParametricSpec};
use ndarray::{Array1, Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TmleError {
    #[error(transparent)]
    Input(#[from] InputError),
    #[error(transparent)]
    Fit(#[from] FitError),
    #[error("Cannot project the fitted run: {0}")]
    Projection(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    /// Iterative targeting of pooled cause-specific hazards.
    #[default]
    Hazard,
    /// Backward recursion of targeted iterated conditional means.
    Mean,
}

/// The three nuisance specifications of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NuisanceSpecs {
    /// `P(A = 1 | W)`; may use neither treatment nor time.
    pub treatment: EstimatorSpec,
    /// Pooled censoring hazard.
    pub censoring: EstimatorSpec,
    /// Pooled failure hazards (hazard method) or iterated means (mean method).
    pub failure: EstimatorSpec,
}

impl Default for NuisanceSpecs {
    fn default() -> Self {
        let pooled = ParametricSpec::new(vec![Term::Treatment, Term::TimeIndicators]);
        Self {
            treatment: EstimatorSpec::Parametric(ParametricSpec::intercept_only()),
            censoring: EstimatorSpec::Parametric(pooled.clone()),
            failure: EstimatorSpec::Parametric(pooled),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimationOptions {
    pub method: Method,
    pub horizon: u32,
    /// Failure types of interest; every observed type when absent.
    pub failure_types: Option<Vec<u8>>,
    pub arms: Vec<u8>,
    pub bounds: Option<Bounds>,
    pub hazard: HazardTmleConfig,
    /// Lower bound applied to treatment probabilities and to `g G`.
    pub g_truncation: f64,
    pub confidence_level: f64,
    /// Skip targeting and report the plug-in G-computation estimate.
    pub gcomp: bool,
    pub return_fits: bool,
}

impl EstimationOptions {
    pub fn new(method: Method, horizon: u32) -> Self {
        Self {
            method,
            horizon,
            failure_types: None,
            arms: vec![0, 1],
            bounds: None,
            hazard: HazardTmleConfig::default(),
            g_truncation: 1e-3,
            confidence_level: 0.95,
            gcomp: false,
            return_fits: false,
        }
    }
}

/// Estimate, influence curve and diagnostics of one target at the horizon.
#[derive(Debug, Clone)]
pub struct EstimateRecord {
    pub target: Target,
    pub estimate: f64,
    pub eic: Array1<f64>,
    pub mean_eic: f64,
    pub variance: f64,
    pub std_error: f64,
    pub ci_lower: f64,
    pub ci_upper: f64,
    /// Hazard method only.
    pub convergence: Option<Convergence>,
    pub diagnostics: Vec<FluctuationDiagnostic>,
}

#[derive(Debug, Clone)]
pub struct TmleFit {
    pub method: Method,
    pub horizon: u32,
    pub confidence_level: f64,
    pub records: Vec<EstimateRecord>,
    /// `cov(EIC) / n` across records, in record order.
    pub covariance: Array2<f64>,
    pub fits: Option<FitBundle>,
}

impl TmleFit {
    pub fn record(&self, target: Target) -> Option<&EstimateRecord> {
        self.records.iter().find(|r| r.target == target)
    }
}

/// Censoring hazard fit, or the marker that nobody was censored before the horizon.
#[derive(Debug, Clone)]
pub enum CensoringModel {
    Uncensored,
    Fitted(FittedModel),
}

/// Method-specific outcome fits.
#[derive(Debug, Clone)]
pub enum OutcomeFits {
    Hazard(HazardFits),
    /// Iterated means are refitted per horizon from this specification.
    Mean(EstimatorSpec),
}

/// Frozen nuisance fits of one run together with what is needed to target them again.
#[derive(Debug, Clone)]
pub struct FitBundle {
    data: ObservedData,
    horizon: u32,
    targets: Vec<Target>,
    failure_types: Vec<u8>,
    arms: Vec<u8>,
    bounds: Bounds,
    hazard_config: HazardTmleConfig,
    targeting: bool,
    outcome: OutcomeFits,
    weights: ArmWeights,
}

/// Raw result for one target before summaries are attached.
#[derive(Debug, Clone)]
pub(crate) struct TargetEstimate {
    pub target: Target,
    pub estimate: f64,
    pub eic: Array1<f64>,
    pub convergence: Option<Convergence>,
    pub diagnostics: Vec<FluctuationDiagnostic>,
}

impl FitBundle {
    pub fn method(&self) -> Method {
        match self.outcome {
            OutcomeFits::Hazard(_) => Method::Hazard,
            OutcomeFits::Mean(_) => Method::Mean,
        }
    }

    pub fn horizon(&self) -> u32 {
        self.horizon
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Targets every estimand at `horizon <= self.horizon()` with the frozen fits.
    pub(crate) fn target_at(&self, horizon: u32) -> Result<Vec<TargetEstimate>, TmleError> {
        match &self.outcome {
            OutcomeFits::Hazard(fits) => {
                let problem = HazardProblem {
                    data: &self.data,
                    horizon,
                    fits,
                    weights: &self.weights,
                    bounds: &self.bounds,
                    config: &self.hazard_config,
                };
                let result = problem.target(&self.targets, self.targeting)?;
                Ok(result
                    .targets
                    .iter()
                    .zip(result.estimates)
                    .zip(result.eics)
                    .map(|((&target, estimate), eic)| TargetEstimate {
                        target,
                        estimate,
                        eic,
                        convergence: result.convergence,
                        diagnostics: result.diagnostics.clone(),
                    })
                    .collect())
            }
            OutcomeFits::Mean(spec) => {
                let problem = MeanProblem {
                    data: &self.data,
                    horizon,
                    spec,
                    weights: &self.weights,
                    bounds: &self.bounds,
                };
                let per_type = self
                    .failure_types
                    .par_iter()
                    .map(|&k| problem.run(k, &self.arms, self.targeting))
                    .collect::<Result<Vec<_>, FitError>>()?;
                Ok(per_type
                    .into_iter()
                    .flat_map(|result| {
                        let diagnostics = result.diagnostics;
                        let ftype = result.ftype;
                        result.arms.into_iter().map(move |arm| TargetEstimate {
                            target: Target::new(arm.arm, ftype),
                            estimate: arm.estimate,
                            eic: arm.eic,
                            convergence: None,
                            diagnostics: diagnostics.clone(),
                        })
                    })
                    .collect())
            }
        }
    }
}

/// Validated request: types of interest, arms and targets in output order.
struct Resolved {
    grid: TimeGrid,
    failure_types: Vec<u8>,
    arms: Vec<u8>,
    targets: Vec<Target>,
    bounds: Bounds,
}

fn resolve(
    data: &ObservedData,
    specs: &NuisanceSpecs,
    options: &EstimationOptions,
) -> Result<Resolved, InputError> {
    let grid = TimeGrid::new(options.horizon)?;
    let observed = data.failure_types();
    let mut failure_types = options
        .failure_types
        .clone()
        .unwrap_or_else(|| observed.clone());
    failure_types.sort_unstable();
    failure_types.dedup();
    if failure_types.is_empty() {
        return Err(InputError::Options(
            "no failure type of interest (no failures were observed)".to_string(),
        ));
    }
    for &k in &failure_types {
        if k == 0 {
            return Err(InputError::ReservedFailureType);
        }
        if !observed.contains(&k) {
            return Err(InputError::UnobservedFailureType(k));
        }
    }

    let mut arms = options.arms.clone();
    arms.sort_unstable();
    arms.dedup();
    if arms.is_empty() {
        return Err(InputError::Options("no treatment arm of interest".to_string()));
    }
    for &a in &arms {
        if a > 1 {
            return Err(InputError::InvalidArm(a));
        }
        if data.arm_size(a) == 0 {
            return Err(InputError::EmptyArm(a));
        }
    }

    if !(options.g_truncation > 0.0 && options.g_truncation < 1.0) {
        return Err(InputError::Options(format!(
            "g truncation must lie in (0, 1), got {}",
            options.g_truncation
        )));
    }
    if !(options.confidence_level > 0.0 && options.confidence_level < 1.0) {
        return Err(InputError::Options(format!(
            "confidence level must lie in (0, 1), got {}",
            options.confidence_level
        )));
    }
    if let Some(tol) = options.hazard.tol {
        if !(tol.is_finite() && tol > 0.0) {
            return Err(InputError::Options(format!(
                "convergence tolerance must be positive, got {tol}"
            )));
        }
    }
    if specs.treatment.uses_treatment() || specs.treatment.uses_time() {
        return Err(InputError::Specification(
            "the treatment model may use baseline covariates only".to_string(),
        ));
    }

    let bounds = options.bounds.clone().unwrap_or_default();
    if !bounds.is_empty() {
        if !specs.failure.is_parametric() {
            return Err(InputError::BoundsRequireParametric("failure"));
        }
        bounds.validate_coverage(&grid, &failure_types)?;
    }

    let targets = failure_types
        .iter()
        .flat_map(|&k| arms.iter().map(move |&a| Target::new(a, k)))
        .collect();
    Ok(Resolved {
        grid,
        failure_types,
        arms,
        targets,
        bounds,
    })
}

/// `P(A = 1 | W)` from one row per subject.
fn fit_treatment(data: &ObservedData, spec: &EstimatorSpec) -> Result<FittedModel, FitError> {
    let rows: Vec<DesignRow> = (0..data.n()).map(|i| DesignRow::new(i, 0, 0)).collect();
    let outcome = data.trt.mapv(f64::from);
    log::info!("Fitting treatment model {}", spec.describe());
    spec.fit(data, &rows, outcome.view())
}

/// Pooled censoring hazard on rows that did not fail at `t`. When nobody is
/// censored before the horizon the censoring survival is identically one.
fn fit_censoring(
    data: &ObservedData,
    horizon: u32,
    spec: &EstimatorSpec,
) -> Result<CensoringModel, FitError> {
    let rows: Vec<DesignRow> = pooled_rows(data, horizon)
        .into_iter()
        .filter(|r| !data.any_failure_at(r.subject, r.time))
        .collect();
    let censored_early = rows
        .iter()
        .any(|r| r.time < horizon && data.censored_at(r.subject, r.time));
    if !censored_early {
        log::info!("No censoring before t={horizon}; censoring survival is one");
        return Ok(CensoringModel::Uncensored);
    }
    let outcome: Array1<f64> = rows
        .iter()
        .map(|r| if data.censored_at(r.subject, r.time) { 1.0 } else { 0.0 })
        .collect();
    log::info!(
        "Fitting censoring model {} on {} pooled rows",
        spec.describe(),
        rows.len()
    );
    Ok(CensoringModel::Fitted(spec.fit(data, &rows, outcome.view())?))
}

fn arm_weights(
    data: &ObservedData,
    horizon: u32,
    treatment: &FittedModel,
    censoring: &CensoringModel,
    floor: f64,
) -> Result<ArmWeights, FitError> {
    let n = data.n();
    let h = horizon as usize;
    let rows: Vec<DesignRow> = (0..n).map(|i| DesignRow::new(i, 0, 0)).collect();
    let treated = treatment.predict(data, &rows)?;

    let arm = |arm: u8| -> Result<InverseWeights, FitError> {
        let propensity = if arm == 1 {
            treated.clone()
        } else {
            treated.mapv(|p| 1.0 - p)
        };
        let mut survival = Array2::<f64>::ones((n, h + 1));
        if let CensoringModel::Fitted(model) = censoring {
            let rows: Vec<DesignRow> = (0..n)
                .flat_map(|i| (1..=horizon).map(move |t| DesignRow::new(i, t, arm)))
                .collect();
            let hazard = model.predict(data, &rows)?;
            for i in 0..n {
                for t in 1..=h {
                    survival[[i, t]] = survival[[i, t - 1]] * (1.0 - hazard[i * h + t - 1]);
                }
            }
        }
        Ok(InverseWeights::new(propensity, survival, floor))
    };
    let weights = ArmWeights::new(arm(0)?, arm(1)?);
    for a in 0..2u8 {
        let truncated = weights
            .arm(a)
            .propensity()
            .iter()
            .filter(|&&g| g <= floor)
            .count();
        if truncated > 0 {
            log::warn!("{truncated} treatment probabilities for arm {a} were truncated at {floor}");
        }
    }
    Ok(weights)
}

fn summarize_records(
    estimates: Vec<TargetEstimate>,
    confidence_level: f64,
) -> Result<(Vec<EstimateRecord>, Array2<f64>), TmleError> {
    let normal = Normal::new(0.0, 1.0)
        .map_err(|e| InputError::Options(format!("normal distribution: {e}")))?;
    let z = normal.inverse_cdf(1.0 - (1.0 - confidence_level) / 2.0);
    let eics: Vec<ArrayView1<f64>> = estimates.iter().map(|e| e.eic.view()).collect();
    let cov = covariance(&eics);
    let records = estimates
        .into_iter()
        .map(|e| {
            let summary = summarize(e.eic.view());
            EstimateRecord {
                target: e.target,
                estimate: e.estimate,
                mean_eic: summary.mean,
                variance: summary.variance,
                std_error: summary.std_error,
                ci_lower: e.estimate - z * summary.std_error,
                ci_upper: e.estimate + z * summary.std_error,
                eic: e.eic,
                convergence: e.convergence,
                diagnostics: e.diagnostics,
            }
        })
        .collect();
    Ok((records, cov))
}

/// Estimates the cumulative incidence of every failure type of interest at
/// `options.horizon` under every arm of interest.
pub fn estimate(
    data: &ObservedData,
    specs: &NuisanceSpecs,
    options: &EstimationOptions,
) -> Result<TmleFit, TmleError> {
    let resolved = resolve(data, specs, options)?;
    let horizon = resolved.grid.horizon();
    log::info!(
        "Estimating {} target(s) at t={horizon} with the {:?} method on {} subjects",
        resolved.targets.len(),
        options.method,
        data.n()
    );

    let treatment = fit_treatment(data, &specs.treatment)?;
    let censoring = fit_censoring(data, horizon, &specs.censoring)?;
    let weights = arm_weights(data, horizon, &treatment, &censoring, options.g_truncation)?;
    let outcome = match options.method {
        Method::Hazard => OutcomeFits::Hazard(fit_hazards(
            data,
            horizon,
            &specs.failure,
            &resolved.bounds,
        )?),
        Method::Mean => OutcomeFits::Mean(specs.failure.clone()),
    };

    let bundle = FitBundle {
        data: data.clone(),
        horizon,
        targets: resolved.targets,
        failure_types: resolved.failure_types,
        arms: resolved.arms,
        bounds: resolved.bounds,
        hazard_config: options.hazard,
        targeting: !options.gcomp,
        outcome,
        weights,
    };
    let estimates = bundle.target_at(horizon)?;
    let (records, covariance) = summarize_records(estimates, options.confidence_level)?;
    for record in &records {
        log::info!(
            "{}: {:.4} (se {:.4}, mean EIC {:.2e})",
            record.target,
            record.estimate,
            record.std_error,
            record.mean_eic
        );
    }

    Ok(TmleFit {
        method: options.method,
        horizon,
        confidence_level: options.confidence_level,
        records,
        covariance,
        fits: options.return_fits.then_some(bundle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn toy_data() -> ObservedData {
        ObservedData::new(
            None,
            &[1, 2, 3, 3, 2, 1, 3, 2, 3, 1, 2, 3],
            &[1, 2, 0, 1, 1, 0, 2, 0, 0, 1, 1, 2],
            &[0, 0, 0, 0, 0, 1, 1, 1, 1, 1, 0, 1],
            Array2::from_shape_vec(
                (12, 1),
                vec![0.2, -0.5, 1.1, 0.3, -1.2, 0.7, 0.0, 0.4, -0.3, 0.9, 0.1, -0.6],
            )
            .unwrap(),
            vec!["W1".into()],
        )
        .unwrap()
    }

    fn intercept_specs() -> NuisanceSpecs {
        let intercept = EstimatorSpec::Parametric(ParametricSpec::intercept_only());
        NuisanceSpecs {
            treatment: intercept.clone(),
            censoring: intercept.clone(),
            failure: intercept,
        }
    }

    #[test]
    fn rejects_invalid_requests() {
        let data = toy_data();
        let specs = intercept_specs();

        let options = EstimationOptions::new(Method::Hazard, 0);
        assert!(matches!(
            estimate(&data, &specs, &options),
            Err(TmleError::Input(InputError::InvalidHorizon))
        ));

        let mut options = EstimationOptions::new(Method::Hazard, 3);
        options.failure_types = Some(vec![3]);
        assert!(matches!(
            estimate(&data, &specs, &options),
            Err(TmleError::Input(InputError::UnobservedFailureType(3)))
        ));

        let mut options = EstimationOptions::new(Method::Mean, 3);
        options.arms = vec![2];
        assert!(matches!(
            estimate(&data, &specs, &options),
            Err(TmleError::Input(InputError::InvalidArm(2)))
        ));

        let mut specs_with_trt = intercept_specs();
        specs_with_trt.treatment = EstimatorSpec::Parametric(ParametricSpec::new(vec![Term::Treatment]));
        let options = EstimationOptions::new(Method::Mean, 3);
        assert!(matches!(
            estimate(&data, &specs_with_trt, &options),
            Err(TmleError::Input(InputError::Specification(_)))
        ));

        let mut options = EstimationOptions::new(Method::Mean, 3);
        let mut bounds = Bounds::new();
        bounds.insert(1, 1, 0.0, 0.5).unwrap();
        options.bounds = Some(bounds);
        options.failure_types = Some(vec![1]);
        assert!(matches!(
            estimate(&data, &specs, &options),
            Err(TmleError::Input(InputError::BoundsMissing { time: 2, ftype: 1 }))
        ));
    }

    #[test]
    fn records_cover_types_by_arms() {
        let data = toy_data();
        let options = EstimationOptions::new(Method::Mean, 3);
        let fit = estimate(&data, &intercept_specs(), &options).unwrap();
        let targets: Vec<Target> = fit.records.iter().map(|r| r.target).collect();
        assert_eq!(
            targets,
            vec![
                Target::new(0, 1),
                Target::new(1, 1),
                Target::new(0, 2),
                Target::new(1, 2)
            ]
        );
        assert_eq!(fit.covariance.dim(), (4, 4));
        for (q, record) in fit.records.iter().enumerate() {
            assert_abs_diff_eq!(fit.covariance[[q, q]], record.variance, epsilon = 1e-15);
            assert!(record.ci_lower <= record.estimate && record.estimate <= record.ci_upper);
            assert!(record.convergence.is_none());
        }
        assert!(fit.fits.is_none());
    }

    #[test]
    fn censoring_before_horizon_is_detected() {
        let data = toy_data();
        let spec = EstimatorSpec::Parametric(ParametricSpec::intercept_only());
        assert!(matches!(
            fit_censoring(&data, 3, &spec).unwrap(),
            CensoringModel::Fitted(_)
        ));
        // At horizon 1 the only censoring (subject 5 at t=1) sits at the horizon.
        assert!(matches!(
            fit_censoring(&data, 1, &spec).unwrap(),
            CensoringModel::Uncensored
        ));
    }

    #[test]
    fn weights_follow_censoring_survival() {
        let data = toy_data();
        let intercept = EstimatorSpec::Parametric(ParametricSpec::intercept_only());
        let treatment = fit_treatment(&data, &intercept).unwrap();
        let censoring = fit_censoring(&data, 3, &intercept).unwrap();
        let weights = arm_weights(&data, 3, &treatment, &censoring, 1e-3).unwrap();
        // Six of twelve subjects are treated.
        assert_abs_diff_eq!(weights.arm(1).propensity()[0], 0.5, epsilon = 1e-8);
        assert_abs_diff_eq!(weights.weight(1, 0, 1), 2.0, epsilon = 1e-8);
        let g2 = weights.arm(1).censoring_survival(0, 2);
        assert!(g2 < 1.0 && g2 > 0.0);
        assert!(weights.weight(1, 0, 3) > weights.weight(1, 0, 2));
    }
}
