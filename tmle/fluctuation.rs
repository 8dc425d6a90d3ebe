//! Logistic fluctuation of an initial estimate along clever covariates.
//!
//! Given initial predictions on the logit scale (the offset) and a matrix of clever
//! covariates, the fluctuation fits `logit(q*) = offset + H epsilon` by maximum
//! likelihood without an intercept. At the solution the score
//! `sum_i H_i (y_i - q*_i)` vanishes, which is exactly the efficient influence
//! curve estimating equation the targeting step has to solve.

use crate::glm::{GlmError, IrlsConfig, IrlsStatus, fit_logistic};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::Serialize;
use std::fmt;

/// Columns whose entries never exceed this magnitude carry no information.
const ZERO_COLUMN_TOLERANCE: f64 = 1e-12;

/// A targeting step that was skipped. Recorded on the estimate, never raised.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum FluctuationDiagnostic {
    /// No observation in the arm carried a non-zero clever covariate.
    ZeroCleverCovariate { time: Option<u32>, arm: u8 },
    /// The fluctuation regression itself failed.
    FitFailed {
        time: Option<u32>,
        iteration: Option<usize>,
        message: String,
    },
}

impl fmt::Display for FluctuationDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FluctuationDiagnostic::ZeroCleverCovariate { time: Some(t), arm } => {
                write!(f, "zero clever covariate for arm {arm} at t={t}")
            }
            FluctuationDiagnostic::ZeroCleverCovariate { time: None, arm } => {
                write!(f, "zero clever covariate for arm {arm}")
            }
            FluctuationDiagnostic::FitFailed {
                time,
                iteration,
                message,
            } => {
                write!(f, "fluctuation failed")?;
                if let Some(t) = time {
                    write!(f, " at t={t}")?;
                }
                if let Some(it) = iteration {
                    write!(f, " in iteration {it}")?;
                }
                write!(f, ": {message}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Fluctuation {
    /// One coefficient per clever-covariate column; zero for degenerate columns.
    pub epsilon: Array1<f64>,
    /// Columns that were identically zero and therefore skipped.
    pub degenerate_columns: Vec<usize>,
    pub status: IrlsStatus,
}

impl Fluctuation {
    fn unchanged(ncols: usize) -> Self {
        Self {
            epsilon: Array1::zeros(ncols),
            degenerate_columns: (0..ncols).collect(),
            status: IrlsStatus::Converged,
        }
    }

    /// A `FitFailed` diagnostic when IRLS stopped before converging, in which case
    /// the score equation may be left unsolved.
    pub fn convergence_diagnostic(
        &self,
        time: Option<u32>,
        iteration: Option<usize>,
    ) -> Option<FluctuationDiagnostic> {
        (self.status != IrlsStatus::Converged).then(|| FluctuationDiagnostic::FitFailed {
            time,
            iteration,
            message: format!("IRLS ended with status {:?}", self.status),
        })
    }
}

/// Fits the fluctuation submodel. Degenerate (all-zero) columns are removed before
/// fitting and reported; if every column is degenerate the fluctuation is the identity.
pub fn fit_fluctuation(
    clever: ArrayView2<f64>,
    outcome: ArrayView1<f64>,
    offset: ArrayView1<f64>,
) -> Result<Fluctuation, GlmError> {
    let ncols = clever.ncols();
    let (active, degenerate_columns): (Vec<usize>, Vec<usize>) = (0..ncols).partition(|&c| {
        clever
            .column(c)
            .iter()
            .any(|v| v.abs() > ZERO_COLUMN_TOLERANCE)
    });
    if active.is_empty() {
        return Ok(Fluctuation::unchanged(ncols));
    }

    let design: Array2<f64> = clever.select(Axis(1), &active);
    let penalty = Array1::zeros(active.len());
    let fit = fit_logistic(
        design.view(),
        outcome,
        Some(offset),
        penalty.view(),
        &IrlsConfig::default(),
    )?;

    let mut epsilon = Array1::zeros(ncols);
    for (local, &column) in active.iter().enumerate() {
        epsilon[column] = fit.beta[local];
    }
    Ok(Fluctuation {
        epsilon,
        degenerate_columns,
        status: fit.status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glm::{expit, logit};
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn solves_score_equation_per_column() {
        let clever = array![[1.2, 0.0], [0.8, 0.0], [0.0, 2.0], [0.0, 1.5], [1.0, 0.0]];
        let outcome = array![1.0, 0.0, 0.3, 0.9, 1.0];
        let initial = array![0.4, 0.5, 0.2, 0.6, 0.7];
        let offset = initial.mapv(logit);
        let fluctuation = fit_fluctuation(clever.view(), outcome.view(), offset.view()).unwrap();
        assert!(fluctuation.degenerate_columns.is_empty());

        let updated: Array1<f64> = (0..outcome.len())
            .map(|i| expit(offset[i] + clever.row(i).dot(&fluctuation.epsilon)))
            .collect();
        let score = clever.t().dot(&(&outcome - &updated));
        assert_abs_diff_eq!(score[0], 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(score[1], 0.0, epsilon = 1e-8);
    }

    #[test]
    fn zero_columns_are_skipped() {
        let clever = array![[0.0, 1.0], [0.0, 2.0], [0.0, 0.5]];
        let outcome = array![0.0, 1.0, 1.0];
        let offset = array![0.0, 0.0, 0.0];
        let fluctuation = fit_fluctuation(clever.view(), outcome.view(), offset.view()).unwrap();
        assert_eq!(fluctuation.degenerate_columns, vec![0]);
        assert_eq!(fluctuation.epsilon[0], 0.0);
        assert!(fluctuation.epsilon[1] > 0.0);
    }

    #[test]
    fn all_zero_clever_covariate_is_identity() {
        let clever = Array2::zeros((3, 1));
        let outcome = array![0.0, 1.0, 1.0];
        let offset = array![0.1, -0.3, 0.2];
        let fluctuation = fit_fluctuation(clever.view(), outcome.view(), offset.view()).unwrap();
        assert_eq!(fluctuation.degenerate_columns, vec![0]);
        assert_eq!(fluctuation.epsilon[0], 0.0);
        assert!(fluctuation.convergence_diagnostic(None, None).is_none());
    }

    #[test]
    fn unconverged_fit_is_reported() {
        let clever = array![[1.0], [2.0], [0.5]];
        let outcome = array![0.2, 0.9, 0.4];
        let offset = array![0.0, 0.0, 0.0];
        let mut fluctuation =
            fit_fluctuation(clever.view(), outcome.view(), offset.view()).unwrap();
        assert_eq!(fluctuation.status, IrlsStatus::Converged);
        assert!(fluctuation.convergence_diagnostic(Some(2), None).is_none());

        fluctuation.status = IrlsStatus::MaxIterationsReached;
        match fluctuation.convergence_diagnostic(Some(2), Some(4)) {
            Some(FluctuationDiagnostic::FitFailed {
                time,
                iteration,
                message,
            }) => {
                assert_eq!(time, Some(2));
                assert_eq!(iteration, Some(4));
                assert!(message.contains("MaxIterationsReached"));
            }
            other => panic!("expected a failed-fit diagnostic, got {other:?}"),
        }
    }
}
