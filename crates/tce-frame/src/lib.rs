#![forbid(unsafe_code)]

//! In-memory columnar dataset: named, equal-length [`Column`]s in a [`Frame`].
//!
//! Rows are positional; there is no label index. The only row-reordering
//! operation is the explicit multi-key [`Frame::sort_by`]. Everything else
//! produces a new frame with the same row order plus new columns.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use tce_types::{DType, Scalar, TypeError, cast_scalar_owned, count_non_missing, infer_dtype};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("column '{name}' has length {column_len}, expected {expected_len}")]
    LengthMismatch {
        name: String,
        column_len: usize,
        expected_len: usize,
    },
    #[error("column '{name}' not found")]
    ColumnNotFound { name: String },
    #[error(transparent)]
    Type(#[from] TypeError),
}

/// A dtype-homogeneous value vector. Values are stored as [`Scalar`]s cast to
/// the column dtype; missing cells hold the dtype's missing marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    dtype: DType,
    values: Vec<Scalar>,
}

impl Column {
    /// Build a column with an explicit dtype, casting every value to it.
    pub fn new(dtype: DType, values: Vec<Scalar>) -> Result<Self, FrameError> {
        let values = values
            .into_iter()
            .map(|value| cast_scalar_owned(value, dtype))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { dtype, values })
    }

    /// Build a column by inferring the common dtype of `values`.
    pub fn from_values(values: Vec<Scalar>) -> Result<Self, FrameError> {
        let dtype = infer_dtype(&values)?;
        Self::new(dtype, values)
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    #[must_use]
    pub fn values(&self) -> &[Scalar] {
        &self.values
    }

    #[must_use]
    pub fn value(&self, idx: usize) -> Option<&Scalar> {
        self.values.get(idx)
    }

    /// Number of missing cells (explicit nulls plus float NaN).
    #[must_use]
    pub fn null_count(&self) -> usize {
        self.len() - count_non_missing(&self.values)
    }

    /// New column with rows taken at `positions`, in selector order.
    #[must_use]
    pub fn take(&self, positions: &[usize]) -> Self {
        let values = positions
            .iter()
            .map(|&pos| self.values[pos].clone())
            .collect();
        Self {
            dtype: self.dtype,
            values,
        }
    }
}

/// Order two non-missing scalars of the same column dtype for sorting.
fn compare_non_missing(left: &Scalar, right: &Scalar) -> Ordering {
    match (left, right) {
        (Scalar::Bool(lhs), Scalar::Bool(rhs)) => lhs.cmp(rhs),
        (Scalar::Int64(lhs), Scalar::Int64(rhs)) => lhs.cmp(rhs),
        (Scalar::Float64(lhs), Scalar::Float64(rhs)) => {
            lhs.partial_cmp(rhs).unwrap_or(Ordering::Equal)
        }
        (Scalar::Utf8(lhs), Scalar::Utf8(rhs)) => lhs.cmp(rhs),
        (Scalar::Datetime(lhs), Scalar::Datetime(rhs)) => lhs.cmp(rhs),
        // Columns are dtype-homogeneous; mixed pairs only appear if malformed
        // values leak in, ordered by dtype as a stable fallback.
        _ => left.dtype().cmp(&right.dtype()),
    }
}

/// Ascending order with missing values last, matching pandas
/// `sort_values(na_position='last')`.
fn compare_with_na_last(left: &Scalar, right: &Scalar) -> Ordering {
    match (left.is_missing(), right.is_missing()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => compare_non_missing(left, right),
    }
}

/// Ordered collection of named, equal-length columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    column_order: Vec<String>,
    columns: BTreeMap<String, Column>,
}

impl Frame {
    /// Construct a frame from `(name, values)` pairs, inferring each column's
    /// dtype. All columns must have equal length.
    pub fn from_pairs(data: Vec<(&str, Vec<Scalar>)>) -> Result<Self, FrameError> {
        let expected_len = data.first().map_or(0, |(_, values)| values.len());

        let mut column_order = Vec::with_capacity(data.len());
        let mut columns = BTreeMap::new();
        for (name, values) in data {
            if values.len() != expected_len {
                return Err(FrameError::LengthMismatch {
                    name: name.to_owned(),
                    column_len: values.len(),
                    expected_len,
                });
            }
            column_order.push(name.to_owned());
            columns.insert(name.to_owned(), Column::from_values(values)?);
        }

        Ok(Self {
            column_order,
            columns,
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.column_order
            .first()
            .and_then(|name| self.columns.get(name))
            .map_or(0, Column::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn num_columns(&self) -> usize {
        self.column_order.len()
    }

    /// Column names in observable frame order.
    #[must_use]
    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.get(name)
    }

    /// Column lookup that fails closed with [`FrameError::ColumnNotFound`].
    pub fn require_column(&self, name: &str) -> Result<&Column, FrameError> {
        self.columns.get(name).ok_or_else(|| FrameError::ColumnNotFound {
            name: name.to_owned(),
        })
    }

    /// Add or replace a column, preserving the order of existing columns.
    /// New names append at the end.
    pub fn with_column(&self, name: impl Into<String>, column: Column) -> Result<Self, FrameError> {
        let name = name.into();
        if column.len() != self.len() && !self.column_order.is_empty() {
            return Err(FrameError::LengthMismatch {
                name,
                column_len: column.len(),
                expected_len: self.len(),
            });
        }
        let mut columns = self.columns.clone();
        columns.insert(name.clone(), column);
        let mut column_order = self.column_order.clone();
        if !column_order.contains(&name) {
            column_order.push(name);
        }
        Ok(Self {
            column_order,
            columns,
        })
    }

    /// Stable ascending multi-key sort, missing values last per key. Ties
    /// across all keys keep their prior relative order.
    pub fn sort_by(&self, by: &[&str]) -> Result<Self, FrameError> {
        let key_columns = by
            .iter()
            .map(|name| self.require_column(name))
            .collect::<Result<Vec<_>, _>>()?;

        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&left_pos, &right_pos| {
            for key in &key_columns {
                let ord = compare_with_na_last(
                    &key.values()[left_pos],
                    &key.values()[right_pos],
                );
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });

        Ok(self.take_rows(&order))
    }

    /// New frame with rows taken at `positions`, in selector order.
    #[must_use]
    pub fn take_rows(&self, positions: &[usize]) -> Self {
        let mut columns = BTreeMap::new();
        for (name, column) in &self.columns {
            columns.insert(name.clone(), column.take(positions));
        }
        Self {
            column_order: self.column_order.clone(),
            columns,
        }
    }
}

#[cfg(test)]
mod tests {
    use tce_types::{DType, NullKind, Scalar};

    use super::{Column, Frame, FrameError};

    fn utf8(s: &str) -> Scalar {
        Scalar::Utf8(s.to_owned())
    }

    #[test]
    fn from_pairs_infers_column_dtypes() {
        let frame = Frame::from_pairs(vec![
            ("store", vec![utf8("A"), utf8("B")]),
            ("sales", vec![Scalar::Int64(10), Scalar::Float64(5.5)]),
        ])
        .expect("frame");

        assert_eq!(frame.len(), 2);
        assert_eq!(frame.column("store").expect("store").dtype(), DType::Utf8);
        assert_eq!(frame.column("sales").expect("sales").dtype(), DType::Float64);
        assert_eq!(
            frame.column("sales").expect("sales").values()[0],
            Scalar::Float64(10.0)
        );
    }

    #[test]
    fn from_pairs_rejects_ragged_columns() {
        let err = Frame::from_pairs(vec![
            ("a", vec![Scalar::Int64(1), Scalar::Int64(2)]),
            ("b", vec![Scalar::Int64(3)]),
        ])
        .expect_err("must fail");
        assert!(matches!(err, FrameError::LengthMismatch { .. }));
    }

    #[test]
    fn require_column_fails_closed() {
        let frame = Frame::from_pairs(vec![("a", vec![Scalar::Int64(1)])]).expect("frame");
        let err = frame.require_column("missing").expect_err("must fail");
        assert_eq!(err.to_string(), "column 'missing' not found");
    }

    #[test]
    fn with_column_appends_new_names_and_replaces_in_place() {
        let frame = Frame::from_pairs(vec![
            ("a", vec![Scalar::Int64(1), Scalar::Int64(2)]),
            ("b", vec![Scalar::Int64(3), Scalar::Int64(4)]),
        ])
        .expect("frame");

        let added = frame
            .with_column(
                "c",
                Column::from_values(vec![Scalar::Int64(5), Scalar::Int64(6)]).expect("column"),
            )
            .expect("with_column");
        assert_eq!(added.column_names(), &["a", "b", "c"]);

        let replaced = added
            .with_column(
                "a",
                Column::from_values(vec![Scalar::Int64(7), Scalar::Int64(8)]).expect("column"),
            )
            .expect("with_column");
        assert_eq!(replaced.column_names(), &["a", "b", "c"]);
        assert_eq!(
            replaced.column("a").expect("a").values(),
            &[Scalar::Int64(7), Scalar::Int64(8)]
        );
    }

    #[test]
    fn with_column_rejects_length_mismatch() {
        let frame = Frame::from_pairs(vec![("a", vec![Scalar::Int64(1), Scalar::Int64(2)])])
            .expect("frame");
        let err = frame
            .with_column(
                "b",
                Column::from_values(vec![Scalar::Int64(1)]).expect("column"),
            )
            .expect_err("must fail");
        assert!(matches!(err, FrameError::LengthMismatch { .. }));
    }

    #[test]
    fn sort_by_single_key_puts_missing_last() {
        let frame = Frame::from_pairs(vec![(
            "t",
            vec![
                Scalar::Int64(3),
                Scalar::Null(NullKind::Null),
                Scalar::Int64(1),
                Scalar::Int64(2),
            ],
        )])
        .expect("frame");

        let sorted = frame.sort_by(&["t"]).expect("sort");
        assert_eq!(
            sorted.column("t").expect("t").values(),
            &[
                Scalar::Int64(1),
                Scalar::Int64(2),
                Scalar::Int64(3),
                Scalar::Null(NullKind::Null),
            ]
        );
    }

    #[test]
    fn sort_by_multi_key_is_stable_on_ties() {
        let frame = Frame::from_pairs(vec![
            ("g", vec![utf8("b"), utf8("a"), utf8("a"), utf8("b")]),
            (
                "t",
                vec![
                    Scalar::Int64(1),
                    Scalar::Int64(1),
                    Scalar::Int64(1),
                    Scalar::Int64(0),
                ],
            ),
            (
                "row",
                vec![
                    Scalar::Int64(0),
                    Scalar::Int64(1),
                    Scalar::Int64(2),
                    Scalar::Int64(3),
                ],
            ),
        ])
        .expect("frame");

        let sorted = frame.sort_by(&["g", "t"]).expect("sort");
        // Rows 1 and 2 tie on both keys and must keep their relative order.
        assert_eq!(
            sorted.column("row").expect("row").values(),
            &[
                Scalar::Int64(1),
                Scalar::Int64(2),
                Scalar::Int64(3),
                Scalar::Int64(0),
            ]
        );
    }

    #[test]
    fn sort_by_unknown_key_fails_closed() {
        let frame = Frame::from_pairs(vec![("a", vec![Scalar::Int64(1)])]).expect("frame");
        let err = frame.sort_by(&["nope"]).expect_err("must fail");
        assert!(matches!(err, FrameError::ColumnNotFound { .. }));
    }

    #[test]
    fn null_count_counts_nan_and_null() {
        let column = Column::from_values(vec![
            Scalar::Float64(1.0),
            Scalar::Float64(f64::NAN),
            Scalar::Null(NullKind::Null),
        ])
        .expect("column");
        assert_eq!(column.null_count(), 2);
    }

    #[test]
    fn datetime_columns_sort_chronologically() {
        let frame = Frame::from_pairs(vec![(
            "ts",
            vec![
                Scalar::Datetime(2_000),
                Scalar::Datetime(1_000),
                Scalar::Null(NullKind::NaT),
            ],
        )])
        .expect("frame");

        let sorted = frame.sort_by(&["ts"]).expect("sort");
        assert_eq!(
            sorted.column("ts").expect("ts").values(),
            &[
                Scalar::Datetime(1_000),
                Scalar::Datetime(2_000),
                Scalar::Null(NullKind::NaT),
            ]
        );
    }
}
