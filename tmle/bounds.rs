//! Box constraints on the per-time-point conditional mean or hazard.
//!
//! Under bounds `[l, u]` a quantity `q` is modelled on the unit scale
//! `(q - l) / (u - l)`, fitted and fluctuated there with a logit link, and mapped
//! back afterwards. Every fitted value therefore stays inside `[l, u]`.

use crate::data::{InputError, TimeGrid, delimiter_for, parse_integer};
use std::collections::BTreeMap;

/// Affine map between a bounded quantity and the unit interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundScale {
    pub lower: f64,
    pub upper: f64,
}

impl BoundScale {
    pub const UNIT: BoundScale = BoundScale {
        lower: 0.0,
        upper: 1.0,
    };

    #[inline]
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }

    /// Rescales `value` so that the bounds map to 0 and 1. Outcomes outside the
    /// bounds land outside `[0, 1]` and are not clipped.
    #[inline]
    pub fn to_unit(&self, value: f64) -> f64 {
        (value - self.lower) / self.width()
    }

    #[inline]
    pub fn from_unit(&self, unit: f64) -> f64 {
        self.lower + self.width() * unit
    }
}

/// Lower/upper bounds keyed by `(time, failure type)`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bounds {
    entries: BTreeMap<(u32, u8), BoundScale>,
}

impl Bounds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, time: u32, ftype: u8, lower: f64, upper: f64) -> Result<(), InputError> {
        if ftype == 0 {
            return Err(InputError::ReservedFailureType);
        }
        let valid = lower.is_finite()
            && upper.is_finite()
            && (0.0..=1.0).contains(&lower)
            && (0.0..=1.0).contains(&upper)
            && lower < upper;
        if !valid {
            return Err(InputError::InvalidBound {
                time,
                ftype,
                lower,
                upper,
            });
        }
        self.entries.insert((time, ftype), BoundScale { lower, upper });
        Ok(())
    }

    pub fn get(&self, time: u32, ftype: u8) -> Option<BoundScale> {
        self.entries.get(&(time, ftype)).copied()
    }

    /// The scale for `(time, ftype)`, or the identity scale when no bound was supplied.
    pub fn scale(&self, time: u32, ftype: u8) -> BoundScale {
        self.get(time, ftype).unwrap_or(BoundScale::UNIT)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every time of the grid must carry a bound for every failure type of interest.
    pub fn validate_coverage(&self, grid: &TimeGrid, ftypes: &[u8]) -> Result<(), InputError> {
        for &ftype in ftypes {
            for time in grid.times() {
                if self.get(time, ftype).is_none() {
                    return Err(InputError::BoundsMissing { time, ftype });
                }
            }
        }
        Ok(())
    }
}

/// Reads a bounds table with a `t` column and one `l<k>`/`u<k>` column pair per
/// failure type `k`. Every listed pair must be complete.
pub fn load_bounds(path: &str) -> Result<Bounds, InputError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter_for(path))
        .trim(csv::Trim::All)
        .from_path(path)?;
    let headers = reader.headers()?.clone();
    let time_idx = headers
        .iter()
        .position(|h| h == "t")
        .ok_or_else(|| InputError::ColumnNotFound("t".to_string()))?;

    let mut pairs: Vec<(u8, usize, usize)> = Vec::new();
    for (lower_idx, name) in headers.iter().enumerate() {
        let Some(suffix) = name.strip_prefix('l') else {
            continue;
        };
        let Ok(ftype) = suffix.parse::<u8>() else {
            continue;
        };
        let upper_name = format!("u{ftype}");
        let upper_idx = headers
            .iter()
            .position(|h| h == upper_name)
            .ok_or(InputError::ColumnNotFound(upper_name))?;
        pairs.push((ftype, lower_idx, upper_idx));
    }
    if pairs.is_empty() {
        return Err(InputError::ColumnNotFound("l1".to_string()));
    }

    let mut bounds = Bounds::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let line = row + 2;
        let time = parse_integer(&record, time_idx, "t", line)?;
        if time < 1 || time > i64::from(u32::MAX) {
            return Err(InputError::NonPositiveTime {
                subject: row,
                found: time,
            });
        }
        for &(ftype, lower_idx, upper_idx) in &pairs {
            let lower = parse_bound(&record, lower_idx, &headers, line)?;
            let upper = parse_bound(&record, upper_idx, &headers, line)?;
            bounds.insert(time as u32, ftype, lower, upper)?;
        }
    }
    log::info!("Loaded bounds for {} (time, type) pairs from {}", bounds.entries.len(), path);
    Ok(bounds)
}

fn parse_bound(
    record: &csv::StringRecord,
    idx: usize,
    headers: &csv::StringRecord,
    line: usize,
) -> Result<f64, InputError> {
    let raw = record.get(idx).unwrap_or_default();
    raw.parse::<f64>().map_err(|_| InputError::InvalidValue {
        row: line,
        column: headers.get(idx).unwrap_or_default().to_string(),
        value: raw.to_string(),
        expected: "number",
    })
}
