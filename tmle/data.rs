//! # Observation Loading and Validation
//!
//! This module is the entry point for user-provided survival data. It reads a
//! delimited table, validates it against a fixed schema and stores it column-wise
//! in the `ndarray` structures consumed by the estimation core.
//!
//! - Fixed schema: `ftime`, `ftype` and `trt` are required, `id` is optional and
//!   every remaining column is treated as a numeric baseline covariate.
//! - Discrete time: failure times are positive integers. Within a time point a
//!   failure precedes censoring, so a subject with `ftime = t` and `ftype = 0` is
//!   observed event-free at `t` and censored afterwards.
//! - User-centric errors: every failure is an `InputError` naming the offending
//!   row or column.

use ndarray::{Array1, Array2, ArrayView1};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::Path;
use thiserror::Error;

/// Every way the observation table, the bounds table or the estimation options can
/// be rejected before any computation starts.
#[derive(Error, Debug)]
pub enum InputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error from the underlying CSV reader: {0}")]
    Csv(#[from] csv::Error),
    #[error("The required column '{0}' was not found in the input file. Please check spelling and case.")]
    ColumnNotFound(String),
    #[error("Column '{0}' appears more than once in the input file.")]
    DuplicateColumn(String),
    #[error("Row {row}: value '{value}' in column '{column}' is not a valid {expected}.")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
        expected: &'static str,
    },
    #[error("The observation table contains no rows.")]
    Empty,
    #[error("Observation arrays have inconsistent lengths: {0}")]
    LengthMismatch(String),
    #[error("Failure times must be positive integers; subject {subject} has {found}.")]
    NonPositiveTime { subject: usize, found: i64 },
    #[error("Failure types must be integers in 0..=255; subject {subject} has {found}.")]
    InvalidFailureType { subject: usize, found: i64 },
    #[error("Treatment must be coded 0 or 1; subject {subject} has {found}.")]
    NonBinaryTreatment { subject: usize, found: i64 },
    #[error("Non-finite values (NaN or Infinity) were found in covariate '{0}'.")]
    NonFiniteCovariate(String),
    #[error("Unknown covariate '{0}'.")]
    UnknownCovariate(String),
    #[error("The horizon must be a positive integer.")]
    InvalidHorizon,
    #[error("Failure type 0 is reserved for censoring and cannot be a target.")]
    ReservedFailureType,
    #[error("Failure type {0} of interest does not occur in the data.")]
    UnobservedFailureType(u8),
    #[error("Treatment arm {0} is not 0 or 1.")]
    InvalidArm(u8),
    #[error("No subjects were assigned to treatment arm {0}.")]
    EmptyArm(u8),
    #[error("Bounds are missing for time {time} and failure type {ftype}.")]
    BoundsMissing { time: u32, ftype: u8 },
    #[error("Bounds for time {time} and failure type {ftype} must satisfy 0 <= lower < upper <= 1 (got [{lower}, {upper}]).")]
    InvalidBound {
        time: u32,
        ftype: u8,
        lower: f64,
        upper: f64,
    },
    #[error("Bounded estimation is only available for parametric {0} models.")]
    BoundsRequireParametric(&'static str),
    #[error("Invalid model specification: {0}")]
    Specification(String),
    #[error("Invalid estimation options: {0}")]
    Options(String),
}

/// Right-censored, discrete-time observations stored column-wise.
#[derive(Debug, Clone)]
pub struct ObservedData {
    pub ids: Vec<String>,
    /// Time of failure or censoring, a positive integer.
    pub ftime: Array1<u32>,
    /// 0 for censored, 1..=K for the observed cause.
    pub ftype: Array1<u8>,
    pub trt: Array1<u8>,
    /// Baseline covariates, shape `[n_subjects, n_covariates]`.
    pub covariates: Array2<f64>,
    pub covariate_names: Vec<String>,
}

impl ObservedData {
    /// Validates raw columns and builds the observation set. Identifiers default to
    /// sequential 1-based strings.
    pub fn new(
        ids: Option<Vec<String>>,
        ftime: &[i64],
        ftype: &[i64],
        trt: &[i64],
        covariates: Array2<f64>,
        covariate_names: Vec<String>,
    ) -> Result<Self, InputError> {
        let n = ftime.len();
        if n == 0 {
            return Err(InputError::Empty);
        }
        if ftype.len() != n || trt.len() != n || covariates.nrows() != n {
            return Err(InputError::LengthMismatch(format!(
                "ftime={}, ftype={}, trt={}, covariates={}",
                n,
                ftype.len(),
                trt.len(),
                covariates.nrows()
            )));
        }
        if covariates.ncols() != covariate_names.len() {
            return Err(InputError::LengthMismatch(format!(
                "{} covariate columns but {} names",
                covariates.ncols(),
                covariate_names.len()
            )));
        }
        let ids = match ids {
            Some(ids) if ids.len() != n => {
                return Err(InputError::LengthMismatch(format!(
                    "{} identifiers for {} subjects",
                    ids.len(),
                    n
                )));
            }
            Some(ids) => ids,
            None => (1..=n).map(|i| i.to_string()).collect(),
        };

        let mut seen = HashSet::new();
        for name in &covariate_names {
            if !seen.insert(name.as_str()) {
                return Err(InputError::DuplicateColumn(name.clone()));
            }
        }

        let mut ftime_out = Array1::<u32>::zeros(n);
        let mut ftype_out = Array1::<u8>::zeros(n);
        let mut trt_out = Array1::<u8>::zeros(n);
        for subject in 0..n {
            let time = ftime[subject];
            if time < 1 || time > i64::from(u32::MAX) {
                return Err(InputError::NonPositiveTime {
                    subject,
                    found: time,
                });
            }
            ftime_out[subject] = time as u32;

            let kind = ftype[subject];
            if !(0..=i64::from(u8::MAX)).contains(&kind) {
                return Err(InputError::InvalidFailureType {
                    subject,
                    found: kind,
                });
            }
            ftype_out[subject] = kind as u8;

            let arm = trt[subject];
            if arm != 0 && arm != 1 {
                return Err(InputError::NonBinaryTreatment {
                    subject,
                    found: arm,
                });
            }
            trt_out[subject] = arm as u8;
        }

        for (column, name) in covariates.columns().into_iter().zip(&covariate_names) {
            if column.iter().any(|v| !v.is_finite()) {
                return Err(InputError::NonFiniteCovariate(name.clone()));
            }
        }

        Ok(Self {
            ids,
            ftime: ftime_out,
            ftype: ftype_out,
            trt: trt_out,
            covariates,
            covariate_names,
        })
    }

    #[inline]
    pub fn n(&self) -> usize {
        self.ftime.len()
    }

    /// Distinct observed failure types, excluding the censoring sentinel, ascending.
    pub fn failure_types(&self) -> Vec<u8> {
        let types: BTreeSet<u8> = self.ftype.iter().copied().filter(|&j| j != 0).collect();
        types.into_iter().collect()
    }

    pub fn arm_size(&self, arm: u8) -> usize {
        self.trt.iter().filter(|&&a| a == arm).count()
    }

    pub fn covariate_index(&self, name: &str) -> Result<usize, InputError> {
        self.covariate_names
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| InputError::UnknownCovariate(name.to_string()))
    }

    pub fn covariate(&self, index: usize) -> ArrayView1<'_, f64> {
        self.covariates.column(index)
    }

    /// A subject is at risk at `t` when neither failure nor censoring happened before `t`.
    #[inline]
    pub fn at_risk(&self, subject: usize, time: u32) -> bool {
        self.ftime[subject] >= time
    }

    #[inline]
    pub fn failed_at(&self, subject: usize, time: u32, ftype: u8) -> bool {
        self.ftime[subject] == time && self.ftype[subject] == ftype
    }

    #[inline]
    pub fn any_failure_at(&self, subject: usize, time: u32) -> bool {
        self.ftime[subject] == time && self.ftype[subject] != 0
    }

    #[inline]
    pub fn censored_at(&self, subject: usize, time: u32) -> bool {
        self.ftime[subject] == time && self.ftype[subject] == 0
    }

    /// Last time point at which the subject contributes a pooled row for horizon `t0`.
    #[inline]
    pub fn last_observed(&self, subject: usize, horizon: u32) -> u32 {
        self.ftime[subject].min(horizon)
    }
}

/// The ordered integer grid `1..=t0` every recursion and pooled regression runs over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeGrid {
    horizon: u32,
}

impl TimeGrid {
    pub fn new(horizon: u32) -> Result<Self, InputError> {
        if horizon == 0 {
            return Err(InputError::InvalidHorizon);
        }
        Ok(Self { horizon })
    }

    #[inline]
    pub fn horizon(&self) -> u32 {
        self.horizon
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.horizon as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.horizon == 0
    }

    pub fn times(&self) -> std::ops::RangeInclusive<u32> {
        1..=self.horizon
    }
}

const FTIME_COLUMN: &str = "ftime";
const FTYPE_COLUMN: &str = "ftype";
const TRT_COLUMN: &str = "trt";
const ID_COLUMN: &str = "id";

/// Loads and validates an observation table. Files ending in `.tsv` are read as
/// tab-delimited, everything else as comma-delimited.
pub fn load_observations(path: &str) -> Result<ObservedData, InputError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut seen = HashSet::new();
    for name in headers.iter() {
        if !seen.insert(name) {
            return Err(InputError::DuplicateColumn(name.to_string()));
        }
    }

    let find = |name: &str| -> Result<usize, InputError> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| InputError::ColumnNotFound(name.to_string()))
    };
    let ftime_idx = find(FTIME_COLUMN)?;
    let ftype_idx = find(FTYPE_COLUMN)?;
    let trt_idx = find(TRT_COLUMN)?;
    let id_idx = headers.iter().position(|h| h == ID_COLUMN);

    let covariate_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(idx, _)| {
            *idx != ftime_idx && *idx != ftype_idx && *idx != trt_idx && Some(*idx) != id_idx
        })
        .map(|(idx, name)| (idx, name.to_string()))
        .collect();

    let mut ids = Vec::new();
    let mut ftime = Vec::new();
    let mut ftype = Vec::new();
    let mut trt = Vec::new();
    let mut covariate_values: Vec<f64> = Vec::new();

    for (row, record) in reader.records().enumerate() {
        let record = record?;
        // Header is line 1.
        let line = row + 2;
        ftime.push(parse_integer(&record, ftime_idx, FTIME_COLUMN, line)?);
        ftype.push(parse_integer(&record, ftype_idx, FTYPE_COLUMN, line)?);
        trt.push(parse_integer(&record, trt_idx, TRT_COLUMN, line)?);
        if let Some(idx) = id_idx {
            ids.push(record.get(idx).unwrap_or_default().to_string());
        }
        for (idx, name) in &covariate_columns {
            let raw = record.get(*idx).unwrap_or_default();
            let value: f64 = raw.parse().map_err(|_| InputError::InvalidValue {
                row: line,
                column: name.clone(),
                value: raw.to_string(),
                expected: "number",
            })?;
            covariate_values.push(value);
        }
    }

    let n = ftime.len();
    let covariates = Array2::from_shape_vec((n, covariate_columns.len()), covariate_values)
        .map_err(|e| InputError::LengthMismatch(e.to_string()))?;
    let names = covariate_columns.into_iter().map(|(_, name)| name).collect();
    let ids = if id_idx.is_some() { Some(ids) } else { None };

    let data = ObservedData::new(ids, &ftime, &ftype, &trt, covariates, names)?;
    log::info!(
        "Loaded {} subjects with {} covariates and failure types {:?} from {}",
        data.n(),
        data.covariate_names.len(),
        data.failure_types(),
        path
    );
    Ok(data)
}

pub(crate) fn delimiter_for(path: &str) -> u8 {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("tsv") | Some("tab") => b'\t',
        _ => b',',
    }
}

pub(crate) fn parse_integer(
    record: &csv::StringRecord,
    idx: usize,
    column: &str,
    line: usize,
) -> Result<i64, InputError> {
    let raw = record.get(idx).unwrap_or_default();
    let invalid = || InputError::InvalidValue {
        row: line,
        column: column.to_string(),
        value: raw.to_string(),
        expected: "integer",
    };
    if let Ok(value) = raw.parse::<i64>() {
        return Ok(value);
    }
    // Integer-valued floats such as "3.0" are accepted.
    let value: f64 = raw.parse().map_err(|_| invalid())?;
    if !value.is_finite() || value.fract() != 0.0 {
        return Err(invalid());
    }
    Ok(value as i64)
}
