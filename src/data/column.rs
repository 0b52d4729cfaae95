//! Typed columns of data and the values a column can be filled with.
use crate::error::PoolError;
use deepsize::DeepSizeOf;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::Arc;

/// A typed array of values, one per row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, DeepSizeOf)]
pub enum Column {
    Float(Vec<f64>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
    /// Rows of `width` floats each, stored row after row in `data`
    Vector { width: usize, data: Vec<f64> },
}

/// A single value: one row of a `Column`, or the default of a column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Float(f64),
    Int(i64),
    Bool(bool),
    Vector(Vec<f64>),
}

impl Column {
    /// The number of rows
    pub fn len(&self) -> usize {
        match self {
            Column::Float(v) => v.len(),
            Column::Int(v) => v.len(),
            Column::Bool(v) => v.len(),
            Column::Vector { width: 0, .. } => 0,
            Column::Vector { width, data } => data.len() / width,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A copy of the rows in `rows`
    pub fn slice(&self, rows: Range<usize>) -> Column {
        match self {
            Column::Float(v) => Column::Float(v[rows].to_vec()),
            Column::Int(v) => Column::Int(v[rows].to_vec()),
            Column::Bool(v) => Column::Bool(v[rows].to_vec()),
            Column::Vector { width, data } => Column::Vector {
                width: *width,
                data: data[rows.start * width..rows.end * width].to_vec(),
            },
        }
    }

    /// A column of the same type with no rows
    pub fn empty_like(&self) -> Column {
        self.slice(0..0)
    }

    /// The value of row `idx`, or `None` if out of bounds
    pub fn get(&self, idx: usize) -> Option<Scalar> {
        match self {
            Column::Float(v) => v.get(idx).map(|x| Scalar::Float(*x)),
            Column::Int(v) => v.get(idx).map(|x| Scalar::Int(*x)),
            Column::Bool(v) => v.get(idx).map(|x| Scalar::Bool(*x)),
            Column::Vector { width, data } => {
                if idx < self.len() {
                    Some(Scalar::Vector(data[idx * width..(idx + 1) * width].to_vec()))
                } else {
                    None
                }
            }
        }
    }

    /// Appends the rows of `other`, which must hold the same type
    pub fn extend(&mut self, other: Column) -> Result<(), PoolError> {
        match (self, other) {
            (Column::Float(a), Column::Float(b)) => a.extend(b),
            (Column::Int(a), Column::Int(b)) => a.extend(b),
            (Column::Bool(a), Column::Bool(b)) => a.extend(b),
            (
                Column::Vector { width, data },
                Column::Vector {
                    width: other_width,
                    data: other_data,
                },
            ) if *width == other_width => data.extend(other_data),
            _ => {
                return Err(PoolError::ProtocolViolation(
                    "cannot join columns of different types".to_string(),
                ))
            }
        }
        Ok(())
    }
}

impl From<Vec<f64>> for Column {
    fn from(v: Vec<f64>) -> Self {
        Column::Float(v)
    }
}

impl From<Vec<i64>> for Column {
    fn from(v: Vec<i64>) -> Self {
        Column::Int(v)
    }
}

impl From<Vec<bool>> for Column {
    fn from(v: Vec<bool>) -> Self {
        Column::Bool(v)
    }
}

impl From<f64> for Scalar {
    fn from(x: f64) -> Self {
        Scalar::Float(x)
    }
}

impl From<i64> for Scalar {
    fn from(x: i64) -> Self {
        Scalar::Int(x)
    }
}

impl From<bool> for Scalar {
    fn from(x: bool) -> Self {
        Scalar::Bool(x)
    }
}

impl From<Vec<f64>> for Scalar {
    fn from(x: Vec<f64>) -> Self {
        Scalar::Vector(x)
    }
}

impl Scalar {
    /// A column of `len` rows that all hold this value
    pub fn to_column(&self, len: usize) -> Column {
        match self {
            Scalar::Float(x) => Column::Float(vec![*x; len]),
            Scalar::Int(x) => Column::Int(vec![*x; len]),
            Scalar::Bool(x) => Column::Bool(vec![*x; len]),
            Scalar::Vector(x) => Column::Vector {
                width: x.len(),
                data: x.iter().copied().cycle().take(x.len() * len).collect(),
            },
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Float(x) => Some(*x),
            Scalar::Int(x) => Some(*x as f64),
            _ => None,
        }
    }
}

/// One column of a batch handed out by a `DataStream`: either data that was
/// read, or a default value repeated for every row of the batch. A repeated
/// value only stores the value once, whatever the length of the batch.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnView {
    Data(Arc<Column>),
    Repeated { value: Scalar, len: usize },
}

impl ColumnView {
    pub fn len(&self) -> usize {
        match self {
            ColumnView::Data(c) => c.len(),
            ColumnView::Repeated { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<Scalar> {
        match self {
            ColumnView::Data(c) => c.get(idx),
            ColumnView::Repeated { value, len } if idx < *len => Some(value.clone()),
            ColumnView::Repeated { .. } => None,
        }
    }

    /// Iterates over every row
    pub fn iter(&self) -> impl Iterator<Item = Scalar> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Whether this column holds a default value rather than read data
    pub fn is_repeated(&self) -> bool {
        matches!(self, ColumnView::Repeated { .. })
    }

    /// The column as an owned array, expanding repeated values
    pub fn materialize(&self) -> Column {
        match self {
            ColumnView::Data(c) => (**c).clone(),
            ColumnView::Repeated { value, len } => value.to_column(*len),
        }
    }
}
