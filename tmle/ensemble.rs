//! Cross-validated ensemble ("super learner") nuisance estimation.
//!
//! Candidates are fitted on `V - 1` folds and predicted on the held-out fold. The
//! resulting out-of-fold prediction matrix is combined either by picking the
//! candidate with the smallest cross-validated squared error, or by non-negative
//! least squares weights normalized to sum to one. Folds are assigned per subject so
//! that every pooled row of a subject is held out together.

use crate::data::{InputError, ObservedData};
use crate::design::{DesignRow, Term};
use crate::linalg::{FaerLinalgError, solve_spd};
use crate::nuisance::{
    FitError, FittedModel, NuisanceEstimator, check_outcome, constant_outcome, fit_logistic_terms,
};
use ndarray::{Array1, Array2, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

const NNLS_TOLERANCE: f64 = 1e-10;

/// A candidate algorithm of the ensemble.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum Learner {
    /// The outcome mean, ignoring covariates.
    Mean,
    /// Unpenalized logistic regression.
    Glm { terms: Vec<Term> },
    /// Ridge-penalized logistic regression.
    Ridge { terms: Vec<Term>, lambda: f64 },
}

impl Learner {
    fn terms(&self) -> &[Term] {
        match self {
            Learner::Mean => &[],
            Learner::Glm { terms } | Learner::Ridge { terms, .. } => terms,
        }
    }

    fn fit(
        &self,
        data: &ObservedData,
        rows: &[DesignRow],
        outcome: ArrayView1<f64>,
    ) -> Result<FittedModel, FitError> {
        match self {
            Learner::Mean => {
                check_outcome(rows, outcome)?;
                Ok(FittedModel::Constant(outcome.mean().unwrap_or(0.0).clamp(0.0, 1.0)))
            }
            Learner::Glm { terms } => fit_logistic_terms(terms, 0.0, data, rows, outcome),
            Learner::Ridge { terms, lambda } => {
                fit_logistic_terms(terms, *lambda, data, rows, outcome)
            }
        }
    }

    fn without_time_terms(&self) -> Self {
        let strip = |terms: &[Term]| -> Vec<Term> {
            terms.iter().filter(|t| !t.is_time()).cloned().collect()
        };
        match self {
            Learner::Mean => Learner::Mean,
            Learner::Glm { terms } => Learner::Glm {
                terms: strip(terms),
            },
            Learner::Ridge { terms, lambda } => Learner::Ridge {
                terms: strip(terms),
                lambda: *lambda,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub name: String,
    pub learner: Learner,
}

impl Candidate {
    pub fn new(name: impl Into<String>, learner: Learner) -> Self {
        Self {
            name: name.into(),
            learner,
        }
    }
}

/// How cross-validated candidate predictions are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Combiner {
    /// Select the single candidate with the lowest cross-validated risk.
    Discrete,
    /// Convex combination from non-negative least squares.
    #[default]
    ConvexNnls,
}

#[derive(Deserialize)]
struct RawEnsembleSpec {
    candidates: Vec<Candidate>,
    #[serde(default)]
    combiner: Combiner,
    #[serde(default = "default_folds")]
    folds: usize,
    #[serde(default)]
    seed: u64,
}

fn default_folds() -> usize {
    10
}

impl TryFrom<RawEnsembleSpec> for EnsembleSpec {
    type Error = InputError;

    fn try_from(raw: RawEnsembleSpec) -> Result<Self, Self::Error> {
        EnsembleSpec::new(raw.candidates, raw.combiner, raw.folds, raw.seed)
    }
}

/// A validated ensemble specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnsembleSpec")]
pub struct EnsembleSpec {
    candidates: Vec<Candidate>,
    combiner: Combiner,
    folds: usize,
    seed: u64,
}

impl EnsembleSpec {
    pub fn new(
        candidates: Vec<Candidate>,
        combiner: Combiner,
        folds: usize,
        seed: u64,
    ) -> Result<Self, InputError> {
        if candidates.is_empty() {
            return Err(InputError::Specification(
                "an ensemble needs at least one candidate".to_string(),
            ));
        }
        let mut names = HashSet::new();
        for candidate in &candidates {
            if !names.insert(candidate.name.as_str()) {
                return Err(InputError::Specification(format!(
                    "duplicate ensemble candidate '{}'",
                    candidate.name
                )));
            }
            if let Learner::Ridge { lambda, .. } = candidate.learner {
                if !lambda.is_finite() || lambda < 0.0 {
                    return Err(InputError::Specification(format!(
                        "candidate '{}' has an invalid ridge penalty {lambda}",
                        candidate.name
                    )));
                }
            }
        }
        if folds < 2 {
            return Err(InputError::Specification(
                "ensembles need at least two cross-validation folds".to_string(),
            ));
        }
        Ok(Self {
            candidates,
            combiner,
            folds,
            seed,
        })
    }

    pub fn candidate_names(&self) -> Vec<String> {
        self.candidates.iter().map(|c| c.name.clone()).collect()
    }

    pub fn uses_time(&self) -> bool {
        self.candidates
            .iter()
            .any(|c| c.learner.terms().iter().any(Term::is_time))
    }

    pub fn uses_treatment(&self) -> bool {
        self.candidates
            .iter()
            .any(|c| c.learner.terms().iter().any(Term::is_treatment))
    }

    pub fn without_time_terms(&self) -> Self {
        Self {
            candidates: self
                .candidates
                .iter()
                .map(|c| Candidate::new(c.name.clone(), c.learner.without_time_terms()))
                .collect(),
            ..self.clone()
        }
    }

    /// Subject-level fold labels for the given rows.
    fn assign_folds(&self, rows: &[DesignRow]) -> Result<Vec<usize>, InputError> {
        let mut subjects: Vec<usize> = rows.iter().map(|r| r.subject).collect();
        subjects.sort_unstable();
        subjects.dedup();
        if subjects.len() < self.folds {
            return Err(InputError::Specification(format!(
                "{} folds requested but only {} subjects are available",
                self.folds,
                subjects.len()
            )));
        }
        let mut rng = StdRng::seed_from_u64(self.seed);
        subjects.shuffle(&mut rng);
        let fold_of: HashMap<usize, usize> = subjects
            .iter()
            .enumerate()
            .map(|(position, &subject)| (subject, position % self.folds))
            .collect();
        Ok(rows.iter().map(|r| fold_of[&r.subject]).collect())
    }
}

/// Member of a fitted ensemble with its combination weight.
#[derive(Debug, Clone)]
pub struct EnsembleMember {
    pub name: String,
    pub weight: f64,
    pub model: FittedModel,
}

#[derive(Debug, Clone)]
pub struct EnsembleModel {
    /// Only candidates with a positive weight are refitted and kept.
    pub members: Vec<EnsembleMember>,
    /// Cross-validated mean squared error per candidate, in specification order.
    pub cv_risks: Vec<(String, f64)>,
}

impl EnsembleModel {
    pub fn predict(&self, data: &ObservedData, rows: &[DesignRow]) -> Result<Array1<f64>, FitError> {
        let mut combined = Array1::<f64>::zeros(rows.len());
        for member in &self.members {
            let predictions = member.model.predict(data, rows)?;
            combined.scaled_add(member.weight, &predictions);
        }
        // Convex weights can overshoot 1 by rounding.
        combined.mapv_inplace(|p| p.clamp(0.0, 1.0));
        Ok(combined)
    }
}

impl NuisanceEstimator for EnsembleSpec {
    fn fit(
        &self,
        data: &ObservedData,
        rows: &[DesignRow],
        outcome: ArrayView1<f64>,
    ) -> Result<FittedModel, FitError> {
        check_outcome(rows, outcome)?;
        if let Some(value) = constant_outcome(outcome) {
            return Ok(FittedModel::Constant(value.clamp(0.0, 1.0)));
        }

        let folds = self.assign_folds(rows)?;
        let n_candidates = self.candidates.len();

        let fold_predictions: Vec<(Vec<usize>, Array2<f64>)> = (0..self.folds)
            .into_par_iter()
            .map(|fold| -> Result<(Vec<usize>, Array2<f64>), FitError> {
                let (train_idx, test_idx): (Vec<usize>, Vec<usize>) =
                    (0..rows.len()).partition(|&r| folds[r] != fold);
                let train_rows: Vec<DesignRow> = train_idx.iter().map(|&r| rows[r]).collect();
                let test_rows: Vec<DesignRow> = test_idx.iter().map(|&r| rows[r]).collect();
                let train_outcome: Array1<f64> = train_idx.iter().map(|&r| outcome[r]).collect();

                let mut predictions = Array2::<f64>::zeros((test_rows.len(), n_candidates));
                for (c, candidate) in self.candidates.iter().enumerate() {
                    let cross_validation_error = || FitError::CrossValidation {
                        candidate: candidate.name.clone(),
                    };
                    let fitted = candidate
                        .learner
                        .fit(data, &train_rows, train_outcome.view())
                        .map_err(|e| {
                            log::warn!("Candidate '{}' failed on fold {}: {}", candidate.name, fold, e);
                            cross_validation_error()
                        })?;
                    let held_out = fitted
                        .predict(data, &test_rows)
                        .map_err(|_| cross_validation_error())?;
                    predictions.column_mut(c).assign(&held_out);
                }
                Ok((test_idx, predictions))
            })
            .collect::<Result<Vec<_>, FitError>>()?;

        let mut z = Array2::<f64>::zeros((rows.len(), n_candidates));
        for (test_idx, predictions) in &fold_predictions {
            for (local, &r) in test_idx.iter().enumerate() {
                z.row_mut(r).assign(&predictions.row(local));
            }
        }

        let cv_risks: Vec<f64> = (0..n_candidates)
            .map(|c| {
                let residual = &outcome - &z.column(c);
                residual.dot(&residual) / rows.len() as f64
            })
            .collect();
        for (candidate, risk) in self.candidates.iter().zip(&cv_risks) {
            if !risk.is_finite() {
                return Err(FitError::CrossValidation {
                    candidate: candidate.name.clone(),
                });
            }
        }

        let best = argmin(&cv_risks);
        let weights = match self.combiner {
            Combiner::Discrete => one_hot(n_candidates, best),
            Combiner::ConvexNnls => {
                let raw = nnls(&z, &outcome.to_owned()).map_err(|_| FitError::CrossValidation {
                    candidate: self.candidates[best].name.clone(),
                })?;
                let total = raw.sum();
                if total > NNLS_TOLERANCE {
                    raw / total
                } else {
                    one_hot(n_candidates, best)
                }
            }
        };

        let mut members = Vec::new();
        for (candidate, &weight) in self.candidates.iter().zip(weights.iter()) {
            if weight <= 0.0 {
                continue;
            }
            let model = candidate.learner.fit(data, rows, outcome)?;
            members.push(EnsembleMember {
                name: candidate.name.clone(),
                weight,
                model,
            });
        }

        log::debug!(
            "Ensemble weights: {}",
            members
                .iter()
                .map(|m| format!("{}={:.3}", m.name, m.weight))
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(FittedModel::Ensemble(EnsembleModel {
            members,
            cv_risks: self
                .candidates
                .iter()
                .map(|c| c.name.clone())
                .zip(cv_risks)
                .collect(),
        }))
    }
}

fn argmin(values: &[f64]) -> usize {
    values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(idx, _)| idx)
        .unwrap_or(0)
}

fn one_hot(len: usize, idx: usize) -> Array1<f64> {
    let mut weights = Array1::zeros(len);
    weights[idx] = 1.0;
    weights
}

/// Lawson–Hanson non-negative least squares: `min ||a x - b||` subject to `x >= 0`.
pub fn nnls(a: &Array2<f64>, b: &Array1<f64>) -> Result<Array1<f64>, FaerLinalgError> {
    let k = a.ncols();
    let ata = a.t().dot(a);
    let atb = a.t().dot(b);
    let mut x = Array1::<f64>::zeros(k);
    let mut passive = vec![false; k];

    let solve_passive = |passive: &[bool]| -> Result<Array1<f64>, FaerLinalgError> {
        let idx: Vec<usize> = (0..k).filter(|&j| passive[j]).collect();
        let mut sub = Array2::<f64>::zeros((idx.len(), idx.len()));
        let mut rhs = Array1::<f64>::zeros(idx.len());
        for (r, &i) in idx.iter().enumerate() {
            rhs[r] = atb[i];
            for (c, &j) in idx.iter().enumerate() {
                sub[[r, c]] = ata[[i, j]];
            }
            // Collinear candidates make the normal equations singular.
            sub[[r, r]] += NNLS_TOLERANCE;
        }
        let solution = solve_spd(&sub, &rhs)?;
        let mut z = Array1::<f64>::zeros(k);
        for (r, &i) in idx.iter().enumerate() {
            z[i] = solution[r];
        }
        Ok(z)
    };

    for _ in 0..(3 * k.max(1)) {
        let gradient = &atb - &ata.dot(&x);
        let candidate = (0..k)
            .filter(|&j| !passive[j] && gradient[j] > NNLS_TOLERANCE)
            .max_by(|&i, &j| gradient[i].total_cmp(&gradient[j]));
        let Some(entering) = candidate else {
            break;
        };
        passive[entering] = true;

        loop {
            let z = solve_passive(&passive)?;
            let infeasible: Vec<usize> = (0..k).filter(|&j| passive[j] && z[j] <= 0.0).collect();
            if infeasible.is_empty() {
                x = z;
                break;
            }
            let alpha = infeasible
                .iter()
                .map(|&j| x[j] / (x[j] - z[j]))
                .fold(f64::INFINITY, f64::min);
            x = &x + &(alpha * (&z - &x));
            for j in 0..k {
                if passive[j] && x[j] <= NNLS_TOLERANCE {
                    passive[j] = false;
                    x[j] = 0.0;
                }
            }
            if !passive.iter().any(|&p| p) {
                break;
            }
        }
    }
    Ok(x.mapv(|v| v.max(0.0)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use rand::Rng;
    use rand_distr::StandardNormal;

    fn simulated_binary(n: usize, seed: u64) -> (ObservedData, Vec<DesignRow>, Array1<f64>) {
        let mut rng = StdRng::seed_from_u64(seed);
        let w: Vec<f64> = (0..n).map(|_| rng.sample(StandardNormal)).collect();
        let y: Array1<f64> = w
            .iter()
            .map(|&wi| {
                let p = 1.0 / (1.0 + (-(1.5 * wi)).exp());
                if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 }
            })
            .collect();
        let data = ObservedData::new(
            None,
            &vec![1_i64; n],
            &vec![0_i64; n],
            &(0..n as i64).map(|i| i % 2).collect::<Vec<_>>(),
            Array2::from_shape_vec((n, 1), w).unwrap(),
            vec!["W1".into()],
        )
        .unwrap();
        let rows = (0..n).map(|i| DesignRow::new(i, 1, data.trt[i])).collect();
        (data, rows, y)
    }

    fn library() -> Vec<Candidate> {
        vec![
            Candidate::new("mean", Learner::Mean),
            Candidate::new(
                "glm",
                Learner::Glm {
                    terms: vec![Term::Covariate("W1".into())],
                },
            ),
        ]
    }

    #[test]
    fn spec_validation() {
        assert!(EnsembleSpec::new(vec![], Combiner::Discrete, 5, 1).is_err());
        let duplicate = vec![
            Candidate::new("a", Learner::Mean),
            Candidate::new("a", Learner::Mean),
        ];
        assert!(EnsembleSpec::new(duplicate, Combiner::Discrete, 5, 1).is_err());
        assert!(EnsembleSpec::new(library(), Combiner::Discrete, 1, 1).is_err());
        let negative = vec![Candidate::new(
            "ridge",
            Learner::Ridge {
                terms: vec![],
                lambda: -1.0,
            },
        )];
        assert!(EnsembleSpec::new(negative, Combiner::Discrete, 5, 1).is_err());
    }

    #[test]
    fn discrete_selector_prefers_informative_candidate() {
        let (data, rows, y) = simulated_binary(400, 5);
        let spec = EnsembleSpec::new(library(), Combiner::Discrete, 5, 17).unwrap();
        let FittedModel::Ensemble(model) = spec.fit(&data, &rows, y.view()).unwrap() else {
            panic!("expected an ensemble fit");
        };
        assert_eq!(model.members.len(), 1);
        assert_eq!(model.members[0].name, "glm");
        assert!(model.cv_risks[1].1 < model.cv_risks[0].1);
    }

    #[test]
    fn convex_weights_sum_to_one() {
        let (data, rows, y) = simulated_binary(300, 9);
        let spec = EnsembleSpec::new(library(), Combiner::ConvexNnls, 4, 3).unwrap();
        let FittedModel::Ensemble(model) = spec.fit(&data, &rows, y.view()).unwrap() else {
            panic!("expected an ensemble fit");
        };
        let total: f64 = model.members.iter().map(|m| m.weight).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-9);
        assert!(model.members.iter().all(|m| m.weight > 0.0));
        let predictions = FittedModel::Ensemble(model).predict(&data, &rows).unwrap();
        assert!(predictions.iter().all(|p| (0.0..=1.0).contains(p)));
    }

    #[test]
    fn folds_keep_subjects_together() {
        let (data, _, _) = simulated_binary(20, 1);
        let rows: Vec<DesignRow> = (0..data.n())
            .flat_map(|i| (1..=3).map(move |t| DesignRow::new(i, t, 0)))
            .collect();
        let spec = EnsembleSpec::new(library(), Combiner::Discrete, 4, 99).unwrap();
        let folds = spec.assign_folds(&rows).unwrap();
        for chunk in folds.chunks(3) {
            assert!(chunk.iter().all(|&f| f == chunk[0]));
        }
        let used: HashSet<usize> = folds.iter().copied().collect();
        assert_eq!(used.len(), 4);
    }

    #[test]
    fn nnls_matches_hand_solution() {
        // b lies in the cone of the first column only.
        let a = array![[1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
        let b = array![2.0, -1.0, 1.0];
        let x = nnls(&a, &b).unwrap();
        assert!(x.iter().all(|&v| v >= 0.0));
        assert_abs_diff_eq!(x[1], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(x[0], 1.5, epsilon = 1e-6);
    }

    #[test]
    fn serde_round_trip_validates() {
        let text = r#"
            combiner = "discrete"
            folds = 3
            [[candidates]]
            name = "mean"
            learner = { kind = "mean" }
            [[candidates]]
            name = "glm"
            learner = { kind = "glm", terms = ["W1", "trt"] }
        "#;
        let spec: EnsembleSpec = toml::from_str(text).unwrap();
        assert_eq!(spec.candidate_names(), vec!["mean", "glm"]);
        assert!(spec.uses_treatment());
        let invalid = "folds = 3\ncandidates = []";
        assert!(toml::from_str::<EnsembleSpec>(invalid).is_err());
    }
}
