use crate::linalg::{FaerLinalgError, solve_spd};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probabilities are kept this far away from 0 and 1 inside the IRLS loop.
pub const PROB_EPS: f64 = 1e-10;
const MIN_WEIGHT: f64 = 1e-10;
/// Added to the Hessian diagonal only, so the fixed point is unchanged.
const HESSIAN_JITTER: f64 = 1e-10;
const MAX_STEP_HALVINGS: usize = 30;

#[derive(Error, Debug)]
pub enum GlmError {
    #[error("Design matrix has {rows} rows but the response has {len} entries.")]
    DimensionMismatch { rows: usize, len: usize },
    #[error("Cannot fit a regression without rows.")]
    EmptyDesign,
    #[error("Response values must be finite.")]
    NonFiniteResponse,
    #[error("A linear system solve failed. The penalized Hessian may be singular. Error: {0}")]
    LinearSystemSolveFailed(#[from] FaerLinalgError),
    #[error("IRLS produced non-finite coefficients at iteration {0}, likely due to perfect separation.")]
    NonFiniteCoefficients(usize),
}

/// The status of the IRLS convergence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IrlsStatus {
    /// Converged successfully within tolerance.
    Converged,
    /// Reached maximum iterations without converging.
    MaxIterationsReached,
    /// Step halving could not reduce the objective any further.
    Unstable,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IrlsConfig {
    pub max_iterations: usize,
    /// Relative change of the penalized objective below which the loop stops.
    pub convergence_tolerance: f64,
}

impl Default for IrlsConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            convergence_tolerance: 1e-12,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogisticFit {
    pub beta: Array1<f64>,
    /// Quasi-binomial deviance `-2 sum(y eta - log(1 + e^eta))` at the final
    /// coefficients, penalty excluded.
    pub deviance: f64,
    pub iterations: usize,
    pub status: IrlsStatus,
}

#[inline]
pub fn expit(eta: f64) -> f64 {
    1.0 / (1.0 + (-eta.clamp(-700.0, 700.0)).exp())
}

#[inline]
pub fn logit(p: f64) -> f64 {
    let p = p.clamp(PROB_EPS, 1.0 - PROB_EPS);
    (p / (1.0 - p)).ln()
}

/// Ridge penalty diagonal that leaves the first (intercept) column unpenalized.
pub fn ridge_penalty(ncols: usize, lambda: f64) -> Array1<f64> {
    let mut penalty = Array1::from_elem(ncols, lambda);
    if ncols > 0 {
        penalty[0] = 0.0;
    }
    penalty
}

pub fn update_glm_vectors(eta: &Array1<f64>) -> (Array1<f64>, Array1<f64>) {
    // Keep mu away from exactly 0 or 1 so weights and deviance stay finite.
    let mu = eta.mapv(|e| expit(e).clamp(PROB_EPS, 1.0 - PROB_EPS));
    let weights = (&mu * &(1.0 - &mu)).mapv(|v| v.max(MIN_WEIGHT));
    (mu, weights)
}

/// `log(1 + e^eta)` without overflow.
#[inline]
fn softplus(eta: f64) -> f64 {
    eta.max(0.0) + (-eta.abs()).exp().ln_1p()
}

/// Twice the negative quasi-binomial log-likelihood. Unlike the binomial deviance
/// this is defined for any real response, so outcomes rescaled by bounds may fall
/// outside `[0, 1]` without being clipped.
pub fn calculate_deviance(y: ArrayView1<f64>, eta: &Array1<f64>) -> f64 {
    2.0 * Zip::from(y)
        .and(eta)
        .fold(0.0, |acc, &yi, &ei| acc + softplus(ei) - yi * ei)
}

fn linear_predictor(
    x: ArrayView2<f64>,
    beta: &Array1<f64>,
    offset: Option<ArrayView1<f64>>,
) -> Array1<f64> {
    let mut eta = x.dot(beta);
    if let Some(offset) = offset {
        eta += &offset;
    }
    eta
}

/// Fits a (quasi-)binomial logistic regression by penalized Newton/IRLS with step
/// halving. `y` may be fractional and may leave `[0, 1]`; the score equations
/// `X'(y - expit(eta))` are solved either way. `penalty` is the diagonal of the ridge penalty,
/// one entry per column. An optional `offset` enters the linear predictor with a
/// fixed coefficient of one.
pub fn fit_logistic(
    x: ArrayView2<f64>,
    y: ArrayView1<f64>,
    offset: Option<ArrayView1<f64>>,
    penalty: ArrayView1<f64>,
    config: &IrlsConfig,
) -> Result<LogisticFit, GlmError> {
    let (n, p) = x.dim();
    if n == 0 {
        return Err(GlmError::EmptyDesign);
    }
    if y.len() != n || offset.is_some_and(|o| o.len() != n) || penalty.len() != p {
        return Err(GlmError::DimensionMismatch { rows: n, len: y.len() });
    }
    if y.iter().any(|v| !v.is_finite()) {
        return Err(GlmError::NonFiniteResponse);
    }

    let objective = |beta: &Array1<f64>| -> (f64, f64, Array1<f64>, Array1<f64>) {
        let eta = linear_predictor(x, beta, offset);
        let (mu, weights) = update_glm_vectors(&eta);
        let deviance = calculate_deviance(y, &eta);
        let penalty_term: f64 = Zip::from(beta).and(penalty).fold(0.0, |acc, &b, &s| acc + s * b * b);
        (deviance + penalty_term, deviance, mu, weights)
    };

    let mut beta = Array1::<f64>::zeros(p);
    let (mut objective_value, mut deviance, mut mu, mut weights) = objective(&beta);
    let mut status = IrlsStatus::MaxIterationsReached;
    let mut iterations = 0;

    for iter in 1..=config.max_iterations {
        iterations = iter;

        let residual = &y - &mu;
        let gradient = x.t().dot(&residual) - &(&penalty * &beta);
        let weighted_x = &x * &weights.view().insert_axis(Axis(1));
        let mut hessian: Array2<f64> = x.t().dot(&weighted_x);
        for j in 0..p {
            hessian[[j, j]] += penalty[j] + HESSIAN_JITTER;
        }
        let delta = solve_spd(&hessian, &gradient)?;

        let mut step = 1.0;
        let mut accepted = None;
        for _ in 0..MAX_STEP_HALVINGS {
            let candidate = &beta + &(step * &delta);
            let evaluated = objective(&candidate);
            if evaluated.0.is_finite() && evaluated.0 <= objective_value + 1e-12 * objective_value.abs() {
                accepted = Some((candidate, evaluated));
                break;
            }
            step *= 0.5;
        }

        let Some((candidate, (new_objective, new_deviance, new_mu, new_weights))) = accepted else {
            log::debug!("IRLS step halving exhausted at iteration {iter}");
            status = IrlsStatus::Unstable;
            break;
        };
        if candidate.iter().any(|b| !b.is_finite()) {
            return Err(GlmError::NonFiniteCoefficients(iter));
        }

        let change = (objective_value - new_objective).abs() / (new_objective.abs() + 0.1);
        beta = candidate;
        objective_value = new_objective;
        deviance = new_deviance;
        mu = new_mu;
        weights = new_weights;

        if change < config.convergence_tolerance {
            status = IrlsStatus::Converged;
            break;
        }
    }

    if beta.iter().any(|b| !b.is_finite()) {
        return Err(GlmError::NonFiniteCoefficients(iterations));
    }
    if status != IrlsStatus::Converged {
        log::debug!(
            "Logistic IRLS ended with status {:?} after {} iterations (deviance {:.6e})",
            status,
            iterations,
            deviance
        );
    }

    Ok(LogisticFit {
        beta,
        deviance,
        iterations,
        status,
    })
}

/// Fitted probabilities `expit(x beta + offset)` without the IRLS clamping.
pub fn predict_logistic(
    x: ArrayView2<f64>,
    beta: &Array1<f64>,
    offset: Option<ArrayView1<f64>>,
) -> Array1<f64> {
    linear_predictor(x, beta, offset).mapv(expit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn simulate(n: usize, beta: &[f64], seed: u64) -> (Array2<f64>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let p = beta.len();
        let mut x = Array2::<f64>::zeros((n, p));
        let mut y = Array1::<f64>::zeros(n);
        for i in 0..n {
            x[[i, 0]] = 1.0;
            for j in 1..p {
                x[[i, j]] = rng.sample(StandardNormal);
            }
            let eta: f64 = (0..p).map(|j| x[[i, j]] * beta[j]).sum();
            y[i] = if rng.gen_range(0.0..1.0) < expit(eta) { 1.0 } else { 0.0 };
        }
        (x, y)
    }

    #[test]
    fn recovers_known_coefficients() {
        let truth = [-0.5, 1.0, -0.75];
        let (x, y) = simulate(5000, &truth, 7);
        let penalty = Array1::zeros(3);
        let fit = fit_logistic(x.view(), y.view(), None, penalty.view(), &IrlsConfig::default())
            .unwrap();
        assert_eq!(fit.status, IrlsStatus::Converged);
        for (estimate, expected) in fit.beta.iter().zip(truth) {
            assert_abs_diff_eq!(*estimate, expected, epsilon = 0.15);
        }
    }

    #[test]
    fn score_equations_are_solved() {
        let (x, y) = simulate(400, &[0.2, 0.8], 11);
        let penalty = Array1::zeros(2);
        let fit = fit_logistic(x.view(), y.view(), None, penalty.view(), &IrlsConfig::default())
            .unwrap();
        let mu = predict_logistic(x.view(), &fit.beta, None);
        let score = x.t().dot(&(&y - &mu));
        assert_abs_diff_eq!(score[0], 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(score[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn intercept_only_fit_matches_marginal_proportion() {
        let x = Array2::ones((5, 1));
        let y = array![1.0, 0.0, 0.0, 1.0, 1.0];
        let penalty = Array1::zeros(1);
        let fit = fit_logistic(x.view(), y.view(), None, penalty.view(), &IrlsConfig::default())
            .unwrap();
        assert_abs_diff_eq!(expit(fit.beta[0]), 0.6, epsilon = 1e-8);
    }

    #[test]
    fn offset_is_held_fixed() {
        // With a single covariate equal to zero the offset alone determines the fit.
        let x = Array2::zeros((4, 1));
        let y = array![0.2, 0.4, 0.6, 0.1];
        let offset = array![0.3, -0.2, 0.5, 1.0];
        let penalty = Array1::zeros(1);
        let fit = fit_logistic(
            x.view(),
            y.view(),
            Some(offset.view()),
            penalty.view(),
            &IrlsConfig::default(),
        )
        .unwrap();
        assert_abs_diff_eq!(fit.beta[0], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn fractional_response_with_offset_solves_score() {
        let x = array![[1.0], [2.0], [0.5], [1.5], [0.0]];
        let y = array![0.3, 0.8, 0.1, 0.5, 0.9];
        let offset = array![0.1, -0.4, 0.2, 0.0, 2.0];
        let penalty = Array1::zeros(1);
        let fit = fit_logistic(
            x.view(),
            y.view(),
            Some(offset.view()),
            penalty.view(),
            &IrlsConfig::default(),
        )
        .unwrap();
        let mu = predict_logistic(x.view(), &fit.beta, Some(offset.view()));
        let score: f64 = x.column(0).dot(&(&y - &mu));
        assert_abs_diff_eq!(score, 0.0, epsilon = 1e-8);
    }

    #[test]
    fn ridge_shrinks_slopes_but_not_intercept() {
        let (x, y) = simulate(300, &[0.0, 1.5], 3);
        let free = fit_logistic(
            x.view(),
            y.view(),
            None,
            Array1::zeros(2).view(),
            &IrlsConfig::default(),
        )
        .unwrap();
        let penalty = ridge_penalty(2, 50.0);
        assert_eq!(penalty[0], 0.0);
        let shrunk =
            fit_logistic(x.view(), y.view(), None, penalty.view(), &IrlsConfig::default()).unwrap();
        assert!(shrunk.beta[1].abs() < free.beta[1].abs());
    }

    #[test]
    fn response_outside_unit_interval_solves_score() {
        // Rescaled outcomes of a bounded fit: (y - l) / (u - l) with l = 0.1, u = 0.5.
        let raw = array![0.0, 1.0, 0.3, 0.0, 0.2, 0.4];
        let y = raw.mapv(|v| (v - 0.1) / 0.4);
        assert!(y.iter().any(|&v| v < 0.0) && y.iter().any(|&v| v > 1.0));
        let x = array![[1.0, 0.2], [1.0, 1.1], [1.0, -0.4], [1.0, 0.0], [1.0, 0.7], [1.0, -1.0]];
        let fit = fit_logistic(
            x.view(),
            y.view(),
            None,
            Array1::zeros(2).view(),
            &IrlsConfig::default(),
        )
        .unwrap();
        assert_eq!(fit.status, IrlsStatus::Converged);
        let mu = predict_logistic(x.view(), &fit.beta, None);
        let score = x.t().dot(&(&y - &mu));
        assert_abs_diff_eq!(score[0], 0.0, epsilon = 1e-8);
        assert_abs_diff_eq!(score[1], 0.0, epsilon = 1e-8);
        // The intercept equation makes the mean of the rescaled fit match the mean
        // of the rescaled outcome, hence the unscaled means agree as well.
        let fitted_raw = mu.mapv(|m| 0.1 + 0.4 * m).mean().unwrap();
        assert_abs_diff_eq!(fitted_raw, raw.mean().unwrap(), epsilon = 1e-8);
    }

    #[test]
    fn rejects_non_finite_response() {
        let x = Array2::ones((2, 1));
        let y = array![0.5, f64::NAN];
        let err = fit_logistic(
            x.view(),
            y.view(),
            None,
            Array1::zeros(1).view(),
            &IrlsConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, GlmError::NonFiniteResponse));
    }
}
