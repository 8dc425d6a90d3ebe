//! # Iterated-Mean TMLE
//!
//! Backward recursion over the time grid for one failure type `k`. At every time
//! point `t = t0, ..., 1` the pseudo-outcome
//!
//! ```text
//! Y_t = dN_k(t) + I(no failure at t) Q*_{t+1}(A, W)
//! ```
//!
//! is regressed among subjects at risk at `t`, predicted for both arms, and
//! fluctuated once along `I(A = a) / (g(a|W) G(t-1|a,W))`. The targeted prediction
//! becomes the continuation of the next (earlier) step. The estimate for arm `a` is
//! the sample mean of `Q*_1(a, W)`.
//!
//! The steps form an explicit ordered schedule; the only state passed between them
//! is the [`Carry`], threaded by value.

use crate::bounds::Bounds;
use crate::data::ObservedData;
use crate::design::DesignRow;
use crate::fluctuation::{FluctuationDiagnostic, fit_fluctuation};
use crate::glm::{expit, logit};
use crate::influence::{ArmWeights, finish_eic};
use crate::nuisance::{EstimatorSpec, FitError, NuisanceEstimator};
use ndarray::{Array1, Array2, ArrayView1};

/// Targeted iterated means of one arm.
#[derive(Debug, Clone)]
pub struct ArmMean {
    pub arm: u8,
    pub estimate: f64,
    pub eic: Array1<f64>,
    /// `Q*_t(a, W_i)` on the original scale, `n x t0`, column `t - 1` holds time `t`.
    pub targeted: Array2<f64>,
}

/// Result of the recursion for one failure type.
#[derive(Debug, Clone)]
pub struct IteratedMeanResult {
    pub ftype: u8,
    pub arms: Vec<ArmMean>,
    pub diagnostics: Vec<FluctuationDiagnostic>,
}

/// Inputs shared by every step of the recursion.
pub struct MeanProblem<'a> {
    pub data: &'a ObservedData,
    pub horizon: u32,
    /// Failure specification; time terms are ignored.
    pub spec: &'a EstimatorSpec,
    pub weights: &'a ArmWeights,
    pub bounds: &'a Bounds,
}

/// State handed from step `t + 1` to step `t`.
struct Carry {
    /// `Q*_{t+1}(a, W_i)` for `a = 0, 1`.
    continuation: [Array1<f64>; 2],
    /// Accumulated weighted residuals per arm of interest.
    martingale: Vec<Array1<f64>>,
    targeted: Vec<Array2<f64>>,
    diagnostics: Vec<FluctuationDiagnostic>,
}

#[derive(Debug, Clone, Copy)]
struct MeanStep {
    time: u32,
}

impl MeanProblem<'_> {
    /// Runs the recursion for failure type `ftype` and every arm in `arms`. With
    /// `targeting = false` the untargeted G-computation means are returned.
    pub fn run(&self, ftype: u8, arms: &[u8], targeting: bool) -> Result<IteratedMeanResult, FitError> {
        let n = self.data.n();
        let h = self.horizon as usize;
        let spec = self.spec.without_time_terms();
        log::info!(
            "Iterated-mean recursion for failure type {ftype} over {} time points with {}",
            self.horizon,
            spec.describe()
        );

        let schedule: Vec<MeanStep> = (1..=self.horizon).rev().map(|time| MeanStep { time }).collect();
        let start = Carry {
            continuation: [Array1::zeros(n), Array1::zeros(n)],
            martingale: vec![Array1::zeros(n); arms.len()],
            targeted: vec![Array2::zeros((n, h)); arms.len()],
            diagnostics: Vec::new(),
        };
        let carry = schedule.iter().try_fold(start, |carry, step| {
            self.step(*step, &spec, ftype, arms, targeting, carry)
        })?;

        let Carry {
            continuation,
            martingale,
            targeted,
            diagnostics,
        } = carry;
        let arms = arms
            .iter()
            .zip(martingale)
            .zip(targeted)
            .map(|((&arm, martingale), targeted)| {
                let plug_in = &continuation[usize::from(arm)];
                let (estimate, eic) = finish_eic(martingale, plug_in.view());
                ArmMean {
                    arm,
                    estimate,
                    eic,
                    targeted,
                }
            })
            .collect();
        Ok(IteratedMeanResult {
            ftype,
            arms,
            diagnostics,
        })
    }

    fn step(
        &self,
        step: MeanStep,
        spec: &EstimatorSpec,
        ftype: u8,
        arms: &[u8],
        targeting: bool,
        mut carry: Carry,
    ) -> Result<Carry, FitError> {
        let data = self.data;
        let t = step.time;
        let n = data.n();
        let risk: Vec<usize> = (0..n).filter(|&i| data.at_risk(i, t)).collect();
        if risk.is_empty() {
            return Err(FitError::EmptyRiskSet { time: t });
        }
        let scale = self.bounds.scale(t, ftype);

        let pseudo: Array1<f64> = risk
            .iter()
            .map(|&i| {
                let event = if data.failed_at(i, t, ftype) { 1.0 } else { 0.0 };
                let continuation = if data.any_failure_at(i, t) {
                    0.0
                } else {
                    carry.continuation[usize::from(data.trt[i])][i]
                };
                event + continuation
            })
            .collect();
        let rows: Vec<DesignRow> = risk
            .iter()
            .map(|&i| DesignRow::new(i, t, data.trt[i]))
            .collect();
        let outcome = pseudo.mapv(|y| scale.to_unit(y));
        let model = spec.fit(data, &rows, outcome.view())?;

        let mut unit = [Array1::zeros(n), Array1::zeros(n)];
        for arm in 0..2u8 {
            let counterfactual: Vec<DesignRow> = (0..n).map(|i| DesignRow::new(i, t, arm)).collect();
            unit[usize::from(arm)] = model.predict(data, &counterfactual)?;
        }

        let epsilon = if targeting {
            self.fluctuate(t, scale.width(), &risk, outcome.view(), &unit, arms, &mut carry.diagnostics)
        } else {
            vec![0.0; arms.len()]
        };

        let mut next = unit.clone().map(|u| u.mapv(|v| scale.from_unit(v)));
        for (q, &arm) in arms.iter().enumerate() {
            let a = usize::from(arm);
            let targeted: Array1<f64> = (0..n)
                .map(|i| {
                    let shift = epsilon[q] * self.weights.weight(arm, i, t) * scale.width();
                    scale.from_unit(expit(logit(unit[a][i]) + shift))
                })
                .collect();
            for (r, &i) in risk.iter().enumerate() {
                if data.trt[i] == arm {
                    carry.martingale[q][i] += self.weights.weight(arm, i, t) * (pseudo[r] - targeted[i]);
                }
            }
            carry.targeted[q].column_mut(t as usize - 1).assign(&targeted);
            next[a] = targeted;
        }
        log::debug!(
            "t={t}: {} at risk, fluctuation coefficients {:?}",
            risk.len(),
            epsilon
        );
        carry.continuation = next;
        Ok(carry)
    }

    /// Fits one coefficient per arm of interest. A failed fit or an arm without
    /// at-risk subjects leaves the corresponding coefficient at zero and records why;
    /// an unconverged fit keeps its last coefficients and is recorded as well.
    fn fluctuate(
        &self,
        t: u32,
        width: f64,
        risk: &[usize],
        outcome: ArrayView1<f64>,
        unit: &[Array1<f64>; 2],
        arms: &[u8],
        diagnostics: &mut Vec<FluctuationDiagnostic>,
    ) -> Vec<f64> {
        let data = self.data;
        let mut clever = Array2::<f64>::zeros((risk.len(), arms.len()));
        let offset: Array1<f64> = risk
            .iter()
            .map(|&i| logit(unit[usize::from(data.trt[i])][i]))
            .collect();
        for (r, &i) in risk.iter().enumerate() {
            for (q, &arm) in arms.iter().enumerate() {
                if data.trt[i] == arm {
                    clever[[r, q]] = self.weights.weight(arm, i, t) * width;
                }
            }
        }
        match fit_fluctuation(clever.view(), outcome, offset.view()) {
            Ok(fluctuation) => {
                for &q in &fluctuation.degenerate_columns {
                    log::warn!("No subject of arm {} is at risk at t={t}; skipping its update", arms[q]);
                    diagnostics.push(FluctuationDiagnostic::ZeroCleverCovariate {
                        time: Some(t),
                        arm: arms[q],
                    });
                }
                if let Some(diagnostic) = fluctuation.convergence_diagnostic(Some(t), None) {
                    log::warn!("Fluctuation at t={t} did not converge: {diagnostic}");
                    diagnostics.push(diagnostic);
                }
                fluctuation.epsilon.to_vec()
            }
            Err(e) => {
                log::warn!("Fluctuation at t={t} failed: {e}");
                diagnostics.push(FluctuationDiagnostic::FitFailed {
                    time: Some(t),
                    iteration: None,
                    message: e.to_string(),
                });
                vec![0.0; arms.len()]
            }
        }
    }
}
