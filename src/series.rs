//! Time-indexed payloads.
//!
//! The framework is agnostic to payload shape beyond "indexed by
//! timestamp". [`Frame`] is the concrete carrier: a strictly increasing
//! timestamp index with named float columns, enough for bar data, signals
//! and everything the combination semantics (append / combine-first /
//! range views) need to be defined on. Static nodes carry an opaque
//! [`serde_json::Value`] instead.

use serde::{Deserialize, Serialize};

use crate::error::FrameError;
use crate::time::{TimeRange, Timestamp};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    /// Cell values; missing cells are `NaN`, stored as `null`.
    #[serde(with = "nan_as_null")]
    pub values: Vec<f64>,
}

/// JSON has no NaN, so missing cells round-trip through `null`.
mod nan_as_null {
    use serde::ser::SerializeSeq;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(values: &[f64], serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(values.len()))?;
        for value in values {
            let cell = (!value.is_nan()).then_some(*value);
            seq.serialize_element(&cell)?;
        }
        seq.end()
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<f64>, D::Error> {
        let cells = Vec::<Option<f64>>::deserialize(deserializer)?;
        Ok(cells
            .into_iter()
            .map(|cell| cell.unwrap_or(f64::NAN))
            .collect())
    }
}

/// A sorted time series with named columns. The index is strictly
/// increasing; all columns have the same length as the index.
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    index: Vec<Timestamp>,
    columns: Vec<Column>,
}

impl Frame {
    pub fn new(index: Vec<Timestamp>, columns: Vec<Column>) -> Result<Self, FrameError> {
        for (row, pair) in index.windows(2).enumerate() {
            if pair[0] >= pair[1] {
                return Err(FrameError::UnsortedIndex(row + 1));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(FrameError::DuplicateColumn(column.name.clone()));
            }
            if column.values.len() != index.len() {
                return Err(FrameError::LengthMismatch {
                    name: column.name.clone(),
                    values: column.values.len(),
                    index: index.len(),
                });
            }
        }

        Ok(Frame { index, columns })
    }

    /// Single-column frame from `(timestamp, value)` points.
    pub fn single(
        name: impl Into<String>,
        points: Vec<(Timestamp, f64)>,
    ) -> Result<Self, FrameError> {
        let (index, values): (Vec<_>, Vec<_>) = points.into_iter().unzip();
        Frame::new(
            index,
            vec![Column {
                name: name.into(),
                values,
            }],
        )
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn index(&self) -> &[Timestamp] {
        &self.index
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.columns
            .iter()
            .find(|column| column.name == name)
            .map(|column| column.values.as_slice())
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn first(&self) -> Option<Timestamp> {
        self.index.first().copied()
    }

    pub fn last(&self) -> Option<Timestamp> {
        self.index.last().copied()
    }

    /// The half-open range `[first, last + resolution)` covered by the
    /// index; `None` when empty. A `view` over this range extracts exactly
    /// the same rows.
    pub fn time_range(&self) -> Option<TimeRange> {
        match (self.first(), self.last()) {
            (Some(first), Some(last)) => {
                TimeRange::of_points(first, last).ok()
            }
            _ => None,
        }
    }

    fn row_bounds(&self, range: &TimeRange) -> (usize, usize) {
        let lo = self.index.partition_point(|t| *t < range.start());
        let hi = self.index.partition_point(|t| *t < range.end());
        (lo, hi)
    }

    /// The rows falling within `range`, column structure preserved.
    pub fn view(&self, range: &TimeRange) -> Frame {
        let (lo, hi) = self.row_bounds(range);
        Frame {
            index: self.index[lo..hi].to_vec(),
            columns: self
                .columns
                .iter()
                .map(|column| Column {
                    name: column.name.clone(),
                    values: column.values[lo..hi].to_vec(),
                })
                .collect(),
        }
    }

    /// The rows outside `range`; inverse of [`Frame::view`].
    pub fn without(&self, range: &TimeRange) -> Frame {
        let (lo, hi) = self.row_bounds(range);
        let keep: Vec<usize> = (0..lo).chain(hi..self.index.len()).collect();
        Frame {
            index: keep.iter().map(|&row| self.index[row]).collect(),
            columns: self
                .columns
                .iter()
                .map(|column| Column {
                    name: column.name.clone(),
                    values: keep.iter().map(|&row| column.values[row]).collect(),
                })
                .collect(),
        }
    }

    /// Append `other` below `self`. The first row of `other` must be
    /// strictly after the last row of `self`.
    pub fn concat(&self, other: &Frame) -> Result<Frame, FrameError> {
        if other.is_empty() {
            return Ok(self.clone());
        }
        if self.is_empty() {
            return Ok(other.clone());
        }

        let index: Vec<Timestamp> = self
            .index
            .iter()
            .chain(other.index.iter())
            .copied()
            .collect();

        let names: Vec<String> = column_union(self, other);
        let columns = names
            .into_iter()
            .map(|name| {
                let mut values = Vec::with_capacity(index.len());
                values.extend(pad(self.column(&name), self.len()));
                values.extend(pad(other.column(&name), other.len()));
                Column { name, values }
            })
            .collect();

        Frame::new(index, columns)
    }

    /// Merge `other` into `self`, keeping `self`'s value wherever both
    /// frames populate the same timestamp and column. Missing cells are
    /// filled from whichever side has them.
    pub fn combine_first(&self, other: &Frame) -> Frame {
        let mut index: Vec<Timestamp> = self
            .index
            .iter()
            .chain(other.index.iter())
            .copied()
            .collect();
        index.sort();
        index.dedup();

        let names = column_union(self, other);
        let columns = names
            .into_iter()
            .map(|name| {
                let values = index
                    .iter()
                    .map(|t| {
                        match self.cell(&name, *t) {
                            Some(v) if !v.is_nan() => v,
                            _ => other.cell(&name, *t).unwrap_or(f64::NAN),
                        }
                    })
                    .collect();
                Column { name, values }
            })
            .collect();

        Frame {
            index,
            columns,
        }
    }

    fn cell(&self, column: &str, t: Timestamp) -> Option<f64> {
        let row = self.index.binary_search(&t).ok()?;
        self.column(column).map(|values| values[row])
    }
}

fn column_union(a: &Frame, b: &Frame) -> Vec<String> {
    let mut names: Vec<String> = a.columns.iter().map(|c| c.name.clone()).collect();
    for column in &b.columns {
        if !names.contains(&column.name) {
            names.push(column.name.clone());
        }
    }
    names
}

fn pad(values: Option<&[f64]>, len: usize) -> Vec<f64> {
    match values {
        Some(values) => values.to_vec(),
        None => vec![f64::NAN; len],
    }
}

/// What a dataset stores: a time-indexed frame, or an opaque value for
/// static nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Series(Frame),
    Scalar(serde_json::Value),
}

impl Payload {
    pub fn as_series(&self) -> Option<&Frame> {
        match self {
            Payload::Series(frame) => Some(frame),
            Payload::Scalar(_) => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&serde_json::Value> {
        match self {
            Payload::Series(_) => None,
            Payload::Scalar(value) => Some(value),
        }
    }

    pub fn time_range(&self) -> Option<TimeRange> {
        self.as_series().and_then(Frame::time_range)
    }
}

impl From<Frame> for Payload {
    fn from(frame: Frame) -> Self {
        Payload::Series(frame)
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Scalar(value)
    }
}
