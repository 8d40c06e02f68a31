#![forbid(unsafe_code)]

//! Target-based categorical encoder.
//!
//! [`Encoder::target_cat_encode`] computes group-wise statistics of numeric
//! target columns, keyed by categorical grouping columns, and attaches the
//! results as new feature columns. Aggregate statistics reduce each group to
//! one scalar and broadcast it to every member row; transform statistics
//! (the `diff_*` lag family) produce a per-row value that depends on row
//! order within the group, so callers wanting time-ordered lags pass a
//! `sort_order`.
//!
//! The input frame is never mutated: encoding operates on an owned working
//! copy and only ever appends columns.

use std::collections::HashMap;
use std::mem::size_of;

use bumpalo::{Bump, collections::Vec as BumpVec};
use thiserror::Error;

use tce_frame::{Column, Frame, FrameError};
use tce_stats::{
    AggCallable, AggSpec, ResolvedStat, StatError, StatRegistry, TransformSpec, expand_statistics,
    resolve,
};
use tce_types::{NullKind, Scalar};

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("no {what} were supplied")]
    EmptySelection { what: &'static str },
    #[error(transparent)]
    Stat(#[from] StatError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

pub const DEFAULT_ARENA_BUDGET_BYTES: usize = 256 * 1024 * 1024;

/// Knobs for grouping intermediates: arena-backed under the byte budget,
/// global allocator above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeExecutionOptions {
    pub use_arena: bool,
    pub arena_budget_bytes: usize,
}

impl Default for EncodeExecutionOptions {
    fn default() -> Self {
        Self {
            use_arena: true,
            arena_budget_bytes: DEFAULT_ARENA_BUDGET_BYTES,
        }
    }
}

// ── Output column naming ───────────────────────────────────────────────

/// Deterministic feature column name:
/// `"tce_" + target + "_" + categories.join("_") + "_" + statistic`.
#[must_use]
pub fn feature_name(target: &str, categories: &[&str], statistic: &str) -> String {
    let mut name = String::from("tce_");
    name.push_str(target);
    for category in categories {
        name.push('_');
        name.push_str(category);
    }
    name.push('_');
    name.push_str(statistic);
    name
}

/// Batch counterpart of [`feature_name`], one name per statistic.
#[must_use]
pub fn feature_names(target: &str, categories: &[&str], statistics: &[&str]) -> Vec<String> {
    statistics
        .iter()
        .map(|statistic| feature_name(target, categories, statistic))
        .collect()
}

// ── Grouping ───────────────────────────────────────────────────────────

/// One component of a row's group key. Missing values (explicit nulls and
/// float NaN) all map to `Null`, so rows with missing grouping values form a
/// single dedicated null group and stay in the output.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
enum KeyPart<'a> {
    Bool(bool),
    Int64(i64),
    FloatBits(u64),
    Utf8(&'a str),
    Datetime(i64),
    Null,
}

impl<'a> KeyPart<'a> {
    fn from_scalar(value: &'a Scalar) -> Self {
        // NaN floats are missing, so the FloatBits arm never sees NaN.
        if value.is_missing() {
            return Self::Null;
        }
        match value {
            Scalar::Bool(v) => Self::Bool(*v),
            Scalar::Int64(v) => Self::Int64(*v),
            Scalar::Float64(v) => Self::FloatBits(v.to_bits()),
            Scalar::Utf8(v) => Self::Utf8(v.as_str()),
            Scalar::Datetime(v) => Self::Datetime(*v),
            Scalar::Null(_) => Self::Null,
        }
    }
}

fn row_key<'a>(key_columns: &[&'a Column], row: usize) -> Vec<KeyPart<'a>> {
    key_columns
        .iter()
        .map(|column| KeyPart::from_scalar(&column.values()[row]))
        .collect()
}

/// Estimate intermediate memory for grouping: per-row position slot plus
/// key-part storage and map-entry overhead.
fn estimate_grouping_intermediate_bytes(rows: usize, key_width: usize) -> usize {
    rows.saturating_mul(
        size_of::<usize>()
            .saturating_add(key_width.saturating_mul(size_of::<KeyPart<'_>>()))
            .saturating_add(64),
    )
}

/// Partition row positions by group key, first-seen group order. Every row
/// lands in exactly one group (null keys included).
fn group_positions(
    key_columns: &[&Column],
    rows: usize,
    exec: EncodeExecutionOptions,
) -> Vec<Vec<usize>> {
    let estimated = estimate_grouping_intermediate_bytes(rows, key_columns.len());
    if exec.use_arena && estimated <= exec.arena_budget_bytes {
        group_positions_arena(key_columns, rows)
    } else {
        group_positions_global(key_columns, rows)
    }
}

fn group_positions_global(key_columns: &[&Column], rows: usize) -> Vec<Vec<usize>> {
    let mut slots = HashMap::<Vec<KeyPart<'_>>, usize>::new();
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for row in 0..rows {
        let key = row_key(key_columns, row);
        let slot = match slots.get(&key) {
            Some(&slot) => slot,
            None => {
                groups.push(Vec::new());
                slots.insert(key, groups.len() - 1);
                groups.len() - 1
            }
        };
        groups[slot].push(row);
    }

    groups
}

/// Arena-backed variant: per-group position vectors live in the bump arena
/// and are copied out once grouping completes.
fn group_positions_arena(key_columns: &[&Column], rows: usize) -> Vec<Vec<usize>> {
    let arena = Bump::new();
    let mut slots = HashMap::<Vec<KeyPart<'_>>, usize>::new();
    let mut groups: Vec<BumpVec<'_, usize>> = Vec::new();

    for row in 0..rows {
        let key = row_key(key_columns, row);
        let slot = match slots.get(&key) {
            Some(&slot) => slot,
            None => {
                groups.push(BumpVec::new_in(&arena));
                slots.insert(key, groups.len() - 1);
                groups.len() - 1
            }
        };
        groups[slot].push(row);
    }

    // Copy results out of the arena before it drops.
    groups
        .iter()
        .map(|positions| positions.as_slice().to_vec())
        .collect()
}

/// Invert group position lists into a row → group-slot map.
fn row_group_slots(groups: &[Vec<usize>], rows: usize) -> Vec<usize> {
    let mut slots = vec![0_usize; rows];
    for (slot, positions) in groups.iter().enumerate() {
        for &row in positions {
            slots[row] = slot;
        }
    }
    slots
}

// ── Strategies ─────────────────────────────────────────────────────────

/// Aggregation strategy: reduce each group's non-missing numeric target
/// values to one scalar per statistic, broadcast to every member row.
fn encode_aggregates(
    frame: &Frame,
    categories: &[&str],
    target: &str,
    statistics: &[(String, AggSpec)],
    groups: &[Vec<usize>],
) -> Result<Frame, EncodeError> {
    let target_column = frame.require_column(target)?;
    let row_slots = row_group_slots(groups, frame.len());

    // Collect each group's numeric values once, shared by all statistics.
    let group_values: Vec<Vec<f64>> = groups
        .iter()
        .map(|positions| {
            positions
                .iter()
                .map(|&row| &target_column.values()[row])
                .filter(|value| !value.is_missing())
                .filter_map(|value| value.to_f64().ok())
                .collect()
        })
        .collect();

    let mut out = frame.clone();
    for (name, spec) in statistics {
        let reduced: Vec<Scalar> = group_values
            .iter()
            .map(|values| spec.reduce(values))
            .collect();
        let broadcast: Vec<Scalar> = row_slots
            .iter()
            .map(|&slot| reduced[slot].clone())
            .collect();
        out = out.with_column(
            feature_name(target, categories, name),
            Column::from_values(broadcast)?,
        )?;
    }

    Ok(out)
}

/// Transform strategy: apply each lag kernel to a group's target values in
/// their current row order and scatter results back to the original row
/// positions. Never re-sorts; sorting is the caller's explicit request.
fn encode_transforms(
    frame: &Frame,
    categories: &[&str],
    target: &str,
    statistics: &[(String, TransformSpec)],
    groups: &[Vec<usize>],
) -> Result<Frame, EncodeError> {
    let target_column = frame.require_column(target)?;

    let mut out = frame.clone();
    for (name, spec) in statistics {
        let mut values = vec![Scalar::Null(NullKind::NaN); frame.len()];
        for positions in groups {
            let group_values: Vec<Scalar> = positions
                .iter()
                .map(|&row| target_column.values()[row].clone())
                .collect();
            for (&row, value) in positions.iter().zip(spec.apply(&group_values)) {
                values[row] = value;
            }
        }
        out = out.with_column(
            feature_name(target, categories, name),
            Column::from_values(values)?,
        )?;
    }

    Ok(out)
}

// ── Encoder ────────────────────────────────────────────────────────────

/// Augmented frame plus the canonical statistic names per class, sorted and
/// deduplicated.
#[derive(Debug, Clone)]
pub struct EncodedInfo {
    pub frame: Frame,
    pub aggregate_names: Vec<String>,
    pub transform_names: Vec<String>,
}

/// The encoding object. Owns the user-statistic registry, so registrations
/// made through `user_stats` persist across calls on the same encoder.
#[derive(Debug, Clone, Default)]
pub struct Encoder {
    registry: StatRegistry,
    exec: EncodeExecutionOptions,
}

impl Encoder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a pre-populated registry (e.g. one shared across encoders
    /// by cloning).
    #[must_use]
    pub fn with_registry(registry: StatRegistry) -> Self {
        Self {
            registry,
            exec: EncodeExecutionOptions::default(),
        }
    }

    #[must_use]
    pub fn with_execution_options(mut self, exec: EncodeExecutionOptions) -> Self {
        self.exec = exec;
        self
    }

    #[must_use]
    pub fn registry(&self) -> &StatRegistry {
        &self.registry
    }

    #[must_use]
    pub fn registry_mut(&mut self) -> &mut StatRegistry {
        &mut self.registry
    }

    /// Encode categorical columns with target statistics, returning the
    /// augmented frame. See [`Encoder::target_cat_encode_with_info`] for the
    /// variant that also reports which statistics were applied per class.
    pub fn target_cat_encode(
        &mut self,
        data: &Frame,
        categories: &[&str],
        targets: &[&str],
        statistics: &[&str],
        user_stats: Vec<(String, AggCallable)>,
        sort_order: Option<&[&str]>,
    ) -> Result<Frame, EncodeError> {
        self.target_cat_encode_with_info(data, categories, targets, statistics, user_stats, sort_order)
            .map(|info| info.frame)
    }

    /// Full encoding pipeline:
    ///
    /// 1. expand bundles and deduplicate statistic tokens;
    /// 2. merge `user_stats` into the encoder's registry (persisting beyond
    ///    this call);
    /// 3. resolve every token — a single bad token aborts the whole call
    ///    before any column is computed;
    /// 4. validate grouping/target/sort columns against the input;
    /// 5. take an owned working copy, sorted if `sort_order` is given
    ///    (stable, missing keys last);
    /// 6. per target: apply transform statistics, then aggregate statistics.
    ///
    /// The caller's `data` is never mutated.
    pub fn target_cat_encode_with_info(
        &mut self,
        data: &Frame,
        categories: &[&str],
        targets: &[&str],
        statistics: &[&str],
        user_stats: Vec<(String, AggCallable)>,
        sort_order: Option<&[&str]>,
    ) -> Result<EncodedInfo, EncodeError> {
        if categories.is_empty() {
            return Err(EncodeError::EmptySelection { what: "categories" });
        }
        if targets.is_empty() {
            return Err(EncodeError::EmptySelection { what: "targets" });
        }
        if statistics.is_empty() {
            return Err(EncodeError::EmptySelection { what: "statistics" });
        }

        let expanded = expand_statistics(statistics.iter().copied());
        self.registry.extend(user_stats);

        // Resolve everything up front: no partial output for a bad token.
        let mut aggregates: Vec<(String, AggSpec)> = Vec::new();
        let mut transforms: Vec<(String, TransformSpec)> = Vec::new();
        for token in &expanded {
            match resolve(&self.registry, token)? {
                ResolvedStat::Aggregate { name, spec } => aggregates.push((name, spec)),
                ResolvedStat::Transform { name, spec } => transforms.push((name, spec)),
            }
        }

        for name in categories.iter().chain(targets.iter()) {
            data.require_column(name)?;
        }
        if let Some(by) = sort_order {
            for name in by {
                data.require_column(name)?;
            }
        }

        let mut working = match sort_order {
            Some(by) => data.sort_by(by)?,
            None => data.clone(),
        };

        let key_columns = categories
            .iter()
            .map(|name| working.require_column(name).map(Column::clone))
            .collect::<Result<Vec<_>, _>>()?;
        let key_refs: Vec<&Column> = key_columns.iter().collect();
        let groups = group_positions(&key_refs, working.len(), self.exec);

        for target in targets {
            if !transforms.is_empty() {
                working = encode_transforms(&working, categories, target, &transforms, &groups)?;
            }
            if !aggregates.is_empty() {
                working = encode_aggregates(&working, categories, target, &aggregates, &groups)?;
            }
        }

        Ok(EncodedInfo {
            frame: working,
            aggregate_names: aggregates.into_iter().map(|(name, _)| name).collect(),
            transform_names: transforms.into_iter().map(|(name, _)| name).collect(),
        })
    }
}
