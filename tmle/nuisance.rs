//! # Nuisance Estimation
//!
//! Every conditional probability the targeting steps consume (treatment assignment,
//! censoring hazard, cause-specific failure hazards and iterated means) is obtained
//! through one contract: a specification is *fitted* on a set of design rows and an
//! outcome in `[0, 1]`, producing a frozen [`FittedModel`] that can *predict* at any
//! other set of rows (other times, counterfactual arms).
//!
//! Two kinds of specification exist:
//!
//! - [`ParametricSpec`]: a logistic regression on an explicit term list. An empty
//!   list is the intercept-only model, which reproduces the marginal proportion.
//! - [`EnsembleSpec`]: a cross-validated combination of named candidate learners.
//!
//! Failures surface as [`FitError`] and abort the estimation call.

use crate::data::{InputError, ObservedData};
use crate::design::{DesignLayout, DesignRow, Term};
use crate::ensemble::{EnsembleModel, EnsembleSpec};
use crate::glm::{GlmError, IrlsConfig, fit_logistic, predict_logistic, ridge_penalty};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FitError {
    #[error("The {model} regression failed: {source}")]
    Regression {
        model: String,
        #[source]
        source: GlmError,
    },
    #[error("The {model} model produced predictions that are not finite probabilities.")]
    InvalidPredictions { model: String },
    #[error("Cross-validation of candidate '{candidate}' could not produce finite predictions.")]
    CrossValidation { candidate: String },
    #[error("No subjects are at risk at time {time}; the regression at that time is undefined.")]
    EmptyRiskSet { time: u32 },
    #[error("Outcome has {outcome} entries but {rows} design rows were supplied.")]
    OutcomeLength { outcome: usize, rows: usize },
    #[error(transparent)]
    Input(#[from] InputError),
}

/// A logistic regression on an explicit list of terms.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ParametricSpec {
    #[serde(default)]
    pub terms: Vec<Term>,
}

impl ParametricSpec {
    pub fn new(terms: Vec<Term>) -> Self {
        Self { terms }
    }

    pub fn intercept_only() -> Self {
        Self::default()
    }

    pub fn uses_time(&self) -> bool {
        self.terms.iter().any(Term::is_time)
    }

    pub fn uses_treatment(&self) -> bool {
        self.terms.iter().any(Term::is_treatment)
    }

    /// Copy of the specification with time terms removed, for regressions that run
    /// at a single time point.
    pub fn without_time_terms(&self) -> Self {
        Self {
            terms: self.terms.iter().filter(|t| !t.is_time()).cloned().collect(),
        }
    }
}

/// How a nuisance quantity is estimated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimatorSpec {
    Parametric(ParametricSpec),
    Ensemble(EnsembleSpec),
}

impl EstimatorSpec {
    pub fn is_parametric(&self) -> bool {
        matches!(self, EstimatorSpec::Parametric(_))
    }

    pub fn uses_time(&self) -> bool {
        match self {
            EstimatorSpec::Parametric(spec) => spec.uses_time(),
            EstimatorSpec::Ensemble(spec) => spec.uses_time(),
        }
    }

    pub fn uses_treatment(&self) -> bool {
        match self {
            EstimatorSpec::Parametric(spec) => spec.uses_treatment(),
            EstimatorSpec::Ensemble(spec) => spec.uses_treatment(),
        }
    }

    pub fn without_time_terms(&self) -> Self {
        match self {
            EstimatorSpec::Parametric(spec) => EstimatorSpec::Parametric(spec.without_time_terms()),
            EstimatorSpec::Ensemble(spec) => EstimatorSpec::Ensemble(spec.without_time_terms()),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            EstimatorSpec::Parametric(spec) => {
                let terms: Vec<String> = spec.terms.iter().map(Term::to_string).collect();
                format!("glm({})", terms.join(" + "))
            }
            EstimatorSpec::Ensemble(spec) => format!("ensemble({})", spec.candidate_names().join(", ")),
        }
    }
}

/// The fit half of the nuisance contract. Prediction lives on [`FittedModel`].
pub trait NuisanceEstimator {
    fn fit(
        &self,
        data: &ObservedData,
        rows: &[DesignRow],
        outcome: ArrayView1<f64>,
    ) -> Result<FittedModel, FitError>;
}

/// Logistic regression coefficients together with the layout that rebuilds their design.
#[derive(Debug, Clone)]
pub struct LogisticModel {
    pub layout: DesignLayout,
    pub beta: Array1<f64>,
}

/// A frozen nuisance fit. Never mutated after fitting.
#[derive(Debug, Clone)]
pub enum FittedModel {
    /// The outcome was constant on the fitting rows.
    Constant(f64),
    Logistic(LogisticModel),
    Ensemble(EnsembleModel),
}

impl FittedModel {
    pub fn predict(&self, data: &ObservedData, rows: &[DesignRow]) -> Result<Array1<f64>, FitError> {
        let predictions = match self {
            FittedModel::Constant(value) => Array1::from_elem(rows.len(), *value),
            FittedModel::Logistic(model) => {
                let x = model.layout.build(data, rows);
                predict_logistic(x.view(), &model.beta, None)
            }
            FittedModel::Ensemble(model) => model.predict(data, rows)?,
        };
        if predictions.iter().any(|p| !p.is_finite() || !(0.0..=1.0).contains(p)) {
            return Err(FitError::InvalidPredictions {
                model: self.kind().to_string(),
            });
        }
        Ok(predictions)
    }

    fn kind(&self) -> &'static str {
        match self {
            FittedModel::Constant(_) => "constant",
            FittedModel::Logistic(_) => "logistic",
            FittedModel::Ensemble(_) => "ensemble",
        }
    }
}

/// Returns the common value when every outcome is identical.
pub(crate) fn constant_outcome(outcome: ArrayView1<f64>) -> Option<f64> {
    let first = *outcome.first()?;
    outcome.iter().all(|&y| y == first).then_some(first)
}

pub(crate) fn check_outcome(rows: &[DesignRow], outcome: ArrayView1<f64>) -> Result<(), FitError> {
    if rows.len() != outcome.len() {
        return Err(FitError::OutcomeLength {
            outcome: outcome.len(),
            rows: rows.len(),
        });
    }
    Ok(())
}

/// Fits a logistic regression on `terms` with a ridge penalty of `lambda` on every
/// non-intercept coefficient.
pub(crate) fn fit_logistic_terms(
    terms: &[Term],
    lambda: f64,
    data: &ObservedData,
    rows: &[DesignRow],
    outcome: ArrayView1<f64>,
) -> Result<FittedModel, FitError> {
    check_outcome(rows, outcome)?;
    // A constant response outside [0, 1] pushes the logit to infinity.
    if let Some(value) = constant_outcome(outcome) {
        return Ok(FittedModel::Constant(value.clamp(0.0, 1.0)));
    }
    let layout = DesignLayout::resolve(terms, data, rows)?;
    let x = layout.build(data, rows);
    let penalty = ridge_penalty(layout.ncols(), lambda);
    let fit = fit_logistic(x.view(), outcome, None, penalty.view(), &IrlsConfig::default())
        .map_err(|source| FitError::Regression {
            model: layout.names().join(" + "),
            source,
        })?;
    log::debug!(
        "Fitted logistic model [{}] on {} rows in {} iterations ({:?})",
        layout.names().join(", "),
        rows.len(),
        fit.iterations,
        fit.status
    );
    Ok(FittedModel::Logistic(LogisticModel {
        layout,
        beta: fit.beta,
    }))
}

impl NuisanceEstimator for ParametricSpec {
    fn fit(
        &self,
        data: &ObservedData,
        rows: &[DesignRow],
        outcome: ArrayView1<f64>,
    ) -> Result<FittedModel, FitError> {
        fit_logistic_terms(&self.terms, 0.0, data, rows, outcome)
    }
}

impl NuisanceEstimator for EstimatorSpec {
    fn fit(
        &self,
        data: &ObservedData,
        rows: &[DesignRow],
        outcome: ArrayView1<f64>,
    ) -> Result<FittedModel, FitError> {
        match self {
            EstimatorSpec::Parametric(spec) => spec.fit(data, rows, outcome),
            EstimatorSpec::Ensemble(spec) => spec.fit(data, rows, outcome),
        }
    }
}
