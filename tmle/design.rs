//! Typed model terms and design-matrix construction.
//!
//! Models are specified as an explicit list of [`Term`]s instead of formulas. A term
//! list is resolved against the observed data once, at fit time, into a
//! [`DesignLayout`] which can then rebuild the same columns for any set of
//! [`DesignRow`]s, including counterfactual treatment arms and other time points.

use crate::data::{InputError, ObservedData};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// One model term. The intercept is always present and never listed.
///
/// Textual form (used by run configurations): `trt`, `t`, `factor(t)`, a covariate
/// name, or `trt:<covariate>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Term {
    /// The treatment arm as a 0/1 column.
    Treatment,
    /// Time as a linear numeric column.
    Time,
    /// One indicator per time level after the first.
    TimeIndicators,
    /// A baseline covariate by column name.
    Covariate(String),
    /// Treatment-by-covariate interaction.
    TreatmentBy(String),
}

impl Term {
    pub fn is_time(&self) -> bool {
        matches!(self, Term::Time | Term::TimeIndicators)
    }

    pub fn is_treatment(&self) -> bool {
        matches!(self, Term::Treatment | Term::TreatmentBy(_))
    }
}

impl FromStr for Term {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        match s {
            "" => Err(InputError::Specification("empty term".to_string())),
            "trt" => Ok(Term::Treatment),
            "t" => Ok(Term::Time),
            "factor(t)" => Ok(Term::TimeIndicators),
            _ => match s.split_once(':') {
                Some(("trt", covariate)) | Some((covariate, "trt")) if !covariate.is_empty() => {
                    Ok(Term::TreatmentBy(covariate.to_string()))
                }
                Some(_) => Err(InputError::Specification(format!(
                    "unsupported interaction '{s}', only trt:<covariate> is available"
                ))),
                None => Ok(Term::Covariate(s.to_string())),
            },
        }
    }
}

impl TryFrom<String> for Term {
    type Error = InputError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Term> for String {
    fn from(term: Term) -> Self {
        term.to_string()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Treatment => write!(f, "trt"),
            Term::Time => write!(f, "t"),
            Term::TimeIndicators => write!(f, "factor(t)"),
            Term::Covariate(name) => write!(f, "{name}"),
            Term::TreatmentBy(name) => write!(f, "trt:{name}"),
        }
    }
}

/// A single row of a (possibly pooled) design: which subject, evaluated at which
/// time and under which treatment arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DesignRow {
    pub subject: usize,
    pub time: u32,
    pub arm: u8,
}

impl DesignRow {
    pub fn new(subject: usize, time: u32, arm: u8) -> Self {
        Self { subject, time, arm }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Column {
    Treatment,
    Time,
    TimeLevel(u32),
    Covariate(usize),
    TreatmentBy(usize),
}

/// Terms resolved against a dataset: covariate names mapped to column indices and
/// time indicators expanded to the levels present in the fitting rows.
#[derive(Debug, Clone, PartialEq)]
pub struct DesignLayout {
    columns: Vec<Column>,
    names: Vec<String>,
}

impl DesignLayout {
    pub fn resolve(
        terms: &[Term],
        data: &ObservedData,
        rows: &[DesignRow],
    ) -> Result<Self, InputError> {
        let mut columns = Vec::new();
        let mut names = vec!["(intercept)".to_string()];
        for term in terms {
            match term {
                Term::Treatment => {
                    columns.push(Column::Treatment);
                    names.push(term.to_string());
                }
                Term::Time => {
                    columns.push(Column::Time);
                    names.push(term.to_string());
                }
                Term::TimeIndicators => {
                    let levels: BTreeSet<u32> = rows.iter().map(|r| r.time).collect();
                    // The first level is absorbed by the intercept.
                    for &level in levels.iter().skip(1) {
                        columns.push(Column::TimeLevel(level));
                        names.push(format!("t={level}"));
                    }
                }
                Term::Covariate(name) => {
                    columns.push(Column::Covariate(data.covariate_index(name)?));
                    names.push(term.to_string());
                }
                Term::TreatmentBy(name) => {
                    columns.push(Column::TreatmentBy(data.covariate_index(name)?));
                    names.push(term.to_string());
                }
            }
        }
        Ok(Self { columns, names })
    }

    /// Number of design columns including the intercept.
    pub fn ncols(&self) -> usize {
        self.columns.len() + 1
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn build(&self, data: &ObservedData, rows: &[DesignRow]) -> Array2<f64> {
        let mut x = Array2::<f64>::zeros((rows.len(), self.ncols()));
        for (r, row) in rows.iter().enumerate() {
            x[[r, 0]] = 1.0;
            for (c, column) in self.columns.iter().enumerate() {
                x[[r, c + 1]] = match *column {
                    Column::Treatment => f64::from(row.arm),
                    Column::Time => f64::from(row.time),
                    Column::TimeLevel(level) => {
                        if row.time == level {
                            1.0
                        } else {
                            0.0
                        }
                    }
                    Column::Covariate(idx) => data.covariates[[row.subject, idx]],
                    Column::TreatmentBy(idx) => {
                        f64::from(row.arm) * data.covariates[[row.subject, idx]]
                    }
                };
            }
        }
        x
    }
}

/// Pooled rows for horizon `t0`: one row per subject and time `1..=min(ftime, t0)`,
/// evaluated at the observed arm.
pub fn pooled_rows(data: &ObservedData, horizon: u32) -> Vec<DesignRow> {
    let mut rows = Vec::new();
    for subject in 0..data.n() {
        let arm = data.trt[subject];
        for time in 1..=data.last_observed(subject, horizon) {
            rows.push(DesignRow::new(subject, time, arm));
        }
    }
    rows
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn toy_data() -> ObservedData {
        ObservedData::new(
            None,
            &[2, 3, 1],
            &[1, 0, 2],
            &[0, 1, 1],
            array![[0.5, 1.0], [1.5, 2.0], [-1.0, 0.0]],
            vec!["W1".into(), "W2".into()],
        )
        .unwrap()
    }

    #[test]
    fn parses_textual_terms() {
        assert_eq!("trt".parse::<Term>().unwrap(), Term::Treatment);
        assert_eq!("factor(t)".parse::<Term>().unwrap(), Term::TimeIndicators);
        assert_eq!(
            "trt:W1".parse::<Term>().unwrap(),
            Term::TreatmentBy("W1".into())
        );
        assert_eq!(
            "W1:trt".parse::<Term>().unwrap(),
            Term::TreatmentBy("W1".into())
        );
        assert!("W1:W2".parse::<Term>().is_err());
        assert_eq!(String::from(Term::TreatmentBy("W2".into())), "trt:W2");
    }

    #[test]
    fn pooled_rows_follow_risk_sets() {
        let data = toy_data();
        let rows = pooled_rows(&data, 2);
        let pairs: Vec<(usize, u32)> = rows.iter().map(|r| (r.subject, r.time)).collect();
        assert_eq!(pairs, vec![(0, 1), (0, 2), (1, 1), (1, 2), (2, 1)]);
    }

    #[test]
    fn design_matrix_columns() {
        let data = toy_data();
        let rows = pooled_rows(&data, 3);
        let terms = vec![
            Term::Treatment,
            Term::TimeIndicators,
            Term::TreatmentBy("W1".into()),
        ];
        let layout = DesignLayout::resolve(&terms, &data, &rows).unwrap();
        assert_eq!(
            layout.names(),
            &["(intercept)", "trt", "t=2", "t=3", "trt:W1"]
        );
        let counterfactual = [DesignRow::new(1, 3, 0), DesignRow::new(1, 2, 1)];
        let x = layout.build(&data, &counterfactual);
        assert_eq!(x.row(0).to_vec(), vec![1.0, 0.0, 0.0, 1.0, 0.0]);
        assert_eq!(x.row(1).to_vec(), vec![1.0, 1.0, 1.0, 0.0, 1.5]);
    }

    #[test]
    fn unknown_covariate_is_an_input_error() {
        let data = toy_data();
        let err = DesignLayout::resolve(&[Term::Covariate("W9".into())], &data, &[]).unwrap_err();
        assert!(matches!(err, InputError::UnknownCovariate(name) if name == "W9"));
    }
}
