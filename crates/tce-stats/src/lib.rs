#![forbid(unsafe_code)]

//! Statistic vocabulary for target-category encoding.
//!
//! A statistic is requested as a string token. Resolution walks an ordered
//! rule chain — exact built-in, registry of user statistics, then the
//! parametrized families (`q_NN`, `iqr[_LOW_HIGH]`, `diff_{abs,pct}_N`) —
//! and produces a typed [`ResolvedStat`]: either an aggregate (group → one
//! scalar, broadcast back) or a transform (group → per-row values, order
//! dependent). The canonical name of a resolved statistic is the input token
//! verbatim; output column naming depends on that.
//!
//! Aggregate kernels follow pandas `groupby().agg(...)` semantics: missing
//! values are skipped before reduction, `count` counts non-missing values,
//! `var`/`std` are sample statistics (ddof=1), quantiles interpolate
//! linearly. Transform kernels follow `Series.diff` / `Series.pct_change`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use tce_types::{NullKind, Scalar};

/// Built-in aggregate statistic tokens, resolved ahead of the registry.
pub const BUILTIN_AGGREGATES: [&str; 9] = [
    "mean", "median", "min", "max", "count", "var", "std", "first", "last",
];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StatError {
    #[error("unknown statistic '{token}'")]
    InvalidStatistic { token: String },
    #[error("malformed parameter in statistic '{token}': {detail}")]
    MalformedParameter { token: String, detail: String },
}

/// A user-supplied aggregate reduction over a group's non-missing numeric
/// values, in row order.
pub type AggCallable = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Registry of user-defined aggregate statistics.
///
/// This is a first-class object rather than process-global state: it lives as
/// long as its owner (typically the encoder), so registrations persist across
/// calls on the same owner, and tests can isolate instances. Registering an
/// existing name overwrites it.
#[derive(Clone, Default)]
pub struct StatRegistry {
    entries: HashMap<String, AggCallable>,
}

impl StatRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, callable: AggCallable) {
        self.entries.insert(name.into(), callable);
    }

    /// Merge `entries` into the registry, last write winning per name.
    pub fn extend<I>(&mut self, entries: I)
    where
        I: IntoIterator<Item = (String, AggCallable)>,
    {
        self.entries.extend(entries);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AggCallable> {
        self.entries.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for StatRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("StatRegistry").field("names", &names).finish()
    }
}

/// An aggregate reduction: a group's values collapse to one scalar.
#[derive(Clone)]
pub enum AggSpec {
    Mean,
    Median,
    Min,
    Max,
    Count,
    Var,
    Std,
    First,
    Last,
    /// Quantile at level `q` in [0, 1], linear interpolation.
    Quantile(f64),
    /// `quantile(high) - quantile(low)`. No ordering is enforced; `low > high`
    /// yields a negative range.
    Iqr { low: f64, high: f64 },
    Custom(AggCallable),
}

impl fmt::Debug for AggSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mean => f.write_str("Mean"),
            Self::Median => f.write_str("Median"),
            Self::Min => f.write_str("Min"),
            Self::Max => f.write_str("Max"),
            Self::Count => f.write_str("Count"),
            Self::Var => f.write_str("Var"),
            Self::Std => f.write_str("Std"),
            Self::First => f.write_str("First"),
            Self::Last => f.write_str("Last"),
            Self::Quantile(q) => write!(f, "Quantile({q})"),
            Self::Iqr { low, high } => write!(f, "Iqr {{ low: {low}, high: {high} }}"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl AggSpec {
    /// Reduce a group's non-missing numeric values (in row order) to one
    /// scalar. An empty group reduces to a missing value; `count` reduces to
    /// zero.
    #[must_use]
    pub fn reduce(&self, values: &[f64]) -> Scalar {
        if let Self::Count = self {
            return Scalar::Int64(values.len() as i64);
        }
        if values.is_empty() {
            return Scalar::Null(NullKind::NaN);
        }

        match self {
            Self::Mean => Scalar::Float64(values.iter().sum::<f64>() / values.len() as f64),
            Self::Median => Scalar::Float64(quantile_linear(&sorted_copy(values), 0.5)),
            Self::Min => Scalar::Float64(values.iter().copied().fold(f64::INFINITY, f64::min)),
            Self::Max => Scalar::Float64(values.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
            Self::Var => sample_var(values).map_or(Scalar::Null(NullKind::NaN), Scalar::Float64),
            Self::Std => sample_var(values)
                .map_or(Scalar::Null(NullKind::NaN), |v| Scalar::Float64(v.sqrt())),
            Self::First => Scalar::Float64(values[0]),
            Self::Last => Scalar::Float64(values[values.len() - 1]),
            Self::Quantile(q) => Scalar::Float64(quantile_linear(&sorted_copy(values), *q)),
            Self::Iqr { low, high } => {
                let sorted = sorted_copy(values);
                Scalar::Float64(quantile_linear(&sorted, *high) - quantile_linear(&sorted, *low))
            }
            Self::Custom(callable) => Scalar::Float64(callable(values)),
            Self::Count => unreachable!("count handled above"),
        }
    }
}

fn sorted_copy(values: &[f64]) -> Vec<f64> {
    let mut sorted = values.to_vec();
    sorted.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    sorted
}

/// Quantile by linear interpolation over a sorted slice, matching
/// `np.quantile(..., method='linear')`. Callers guarantee non-empty input.
fn quantile_linear(sorted: &[f64], q: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = pos - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

/// Sample variance (ddof=1). `None` with fewer than two values.
fn sample_var(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some(ss / (n - 1.0))
}

/// An order-dependent per-row reduction within a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformSpec {
    /// `out[i] = x[i] - x[i - n]`, matching `Series.diff(n)`.
    DiffAbs(usize),
    /// `out[i] = (x[i] - x[i - n]) / x[i - n]`, matching `Series.pct_change(n)`.
    DiffPct(usize),
}

impl TransformSpec {
    /// Apply the lag kernel to a group's values in their current row order.
    /// Positions without a lagged predecessor, and positions where either
    /// operand is missing or non-numeric, produce a missing value.
    #[must_use]
    pub fn apply(&self, values: &[Scalar]) -> Vec<Scalar> {
        let (n, pct) = match self {
            Self::DiffAbs(n) => (*n, false),
            Self::DiffPct(n) => (*n, true),
        };

        let mut out = Vec::with_capacity(values.len());
        for i in 0..values.len() {
            let lagged = match i.checked_sub(n) {
                Some(j) if !values[i].is_missing() && !values[j].is_missing() => {
                    match (values[i].to_f64(), values[j].to_f64()) {
                        (Ok(current), Ok(prior)) => {
                            // Division by zero follows IEEE-754, as pct_change does.
                            let delta = current - prior;
                            Some(if pct { delta / prior } else { delta })
                        }
                        _ => None,
                    }
                }
                _ => None,
            };
            out.push(lagged.map_or(Scalar::Null(NullKind::NaN), Scalar::Float64));
        }
        out
    }
}

/// A statistic token resolved to its canonical name and typed reduction.
#[derive(Debug, Clone)]
pub enum ResolvedStat {
    Aggregate { name: String, spec: AggSpec },
    Transform { name: String, spec: TransformSpec },
}

impl ResolvedStat {
    /// Canonical name: the input token verbatim.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Aggregate { name, .. } | Self::Transform { name, .. } => name,
        }
    }

    #[must_use]
    pub fn is_transform(&self) -> bool {
        matches!(self, Self::Transform { .. })
    }
}

/// Classification rule: a token is a transform iff its first
/// underscore-delimited segment is `diff`. Applied before resolution, so
/// `diff`-prefixed names are reserved for the lag family and never hit the
/// registry.
#[must_use]
pub fn is_transform_token(token: &str) -> bool {
    token.split('_').next() == Some("diff")
}

/// Resolve a statistic token against the rule chain, first match winning:
/// built-in aggregate, registry entry, `q_NN`, `iqr`/`iqr_LOW_HIGH`,
/// `diff_{abs,pct}_N`. Unmatched tokens fail with
/// [`StatError::InvalidStatistic`].
pub fn resolve(registry: &StatRegistry, token: &str) -> Result<ResolvedStat, StatError> {
    if is_transform_token(token) {
        let spec = parse_diff(token)?;
        return Ok(ResolvedStat::Transform {
            name: token.to_owned(),
            spec,
        });
    }

    let spec = if let Some(builtin) = builtin_aggregate(token) {
        builtin
    } else if let Some(callable) = registry.get(token) {
        AggSpec::Custom(Arc::clone(callable))
    } else if let Some(parsed) = parse_quantile(token) {
        parsed?
    } else if let Some(parsed) = parse_iqr(token) {
        parsed?
    } else {
        return Err(StatError::InvalidStatistic {
            token: token.to_owned(),
        });
    };

    Ok(ResolvedStat::Aggregate {
        name: token.to_owned(),
        spec,
    })
}

fn builtin_aggregate(token: &str) -> Option<AggSpec> {
    let spec = match token {
        "mean" => AggSpec::Mean,
        "median" => AggSpec::Median,
        "min" => AggSpec::Min,
        "max" => AggSpec::Max,
        "count" => AggSpec::Count,
        "var" => AggSpec::Var,
        "std" => AggSpec::Std,
        "first" => AggSpec::First,
        "last" => AggSpec::Last,
        _ => return None,
    };
    Some(spec)
}

/// `q_NN` with exactly two digits: quantile at level NN/100. Other `q_`
/// tokens carry a malformed level.
fn parse_quantile(token: &str) -> Option<Result<AggSpec, StatError>> {
    let rest = token.strip_prefix("q_")?;
    if rest.len() == 2 && rest.bytes().all(|b| b.is_ascii_digit()) {
        let level: f64 = rest.parse().ok()?;
        Some(Ok(AggSpec::Quantile(level / 100.0)))
    } else {
        Some(Err(StatError::MalformedParameter {
            token: token.to_owned(),
            detail: format!("expected a two-digit quantile level, found '{rest}'"),
        }))
    }
}

/// Bare `iqr` defaults to the 75th-minus-25th-percentile range;
/// `iqr_LOW_HIGH` takes integer percentages in [0, 100]. `low > high` is
/// allowed and yields a negative range.
fn parse_iqr(token: &str) -> Option<Result<AggSpec, StatError>> {
    if token == "iqr" {
        return Some(Ok(AggSpec::Iqr {
            low: 0.25,
            high: 0.75,
        }));
    }
    let rest = token.strip_prefix("iqr_")?;

    let malformed = |detail: String| {
        Some(Err(StatError::MalformedParameter {
            token: token.to_owned(),
            detail,
        }))
    };

    let bounds: Vec<&str> = rest.split('_').collect();
    if bounds.len() != 2 {
        return malformed(format!(
            "expected two percentage bounds, found {}",
            bounds.len()
        ));
    }
    let mut parsed = [0.0_f64; 2];
    for (slot, raw) in parsed.iter_mut().zip(&bounds) {
        match raw.parse::<u32>() {
            Ok(pct) if pct <= 100 => *slot = f64::from(pct) / 100.0,
            Ok(pct) => return malformed(format!("percentage bound {pct} exceeds 100")),
            Err(_) => return malformed(format!("non-numeric percentage bound '{raw}'")),
        }
    }
    Some(Ok(AggSpec::Iqr {
        low: parsed[0],
        high: parsed[1],
    }))
}

/// `diff_abs_N` / `diff_pct_N` with a positive integer lag. Any other
/// `diff_*` token is invalid.
fn parse_diff(token: &str) -> Result<TransformSpec, StatError> {
    let invalid = || StatError::InvalidStatistic {
        token: token.to_owned(),
    };

    let rest = token.strip_prefix("diff_").ok_or_else(invalid)?;
    let (kind, raw_lag) = rest.split_once('_').ok_or_else(invalid)?;

    let lag = match raw_lag.parse::<usize>() {
        Ok(0) => {
            return Err(StatError::MalformedParameter {
                token: token.to_owned(),
                detail: "lag must be a positive integer".to_owned(),
            });
        }
        Ok(lag) => lag,
        Err(_) => {
            return Err(StatError::MalformedParameter {
                token: token.to_owned(),
                detail: format!("non-numeric lag '{raw_lag}'"),
            });
        }
    };

    match kind {
        "abs" => Ok(TransformSpec::DiffAbs(lag)),
        "pct" => Ok(TransformSpec::DiffPct(lag)),
        _ => Err(invalid()),
    }
}

/// Composite bundle membership. Bundles expand eagerly before resolution.
fn bundle_members(name: &str) -> Option<&'static [&'static str]> {
    const CLASSIC: &[&str] = &["min", "q_25", "median", "q_75", "max", "mean", "std"];
    const CLASSIC_TS: &[&str] = &[
        "min", "q_25", "median", "q_75", "max", "mean", "std", "first", "last",
    ];
    match name {
        "classic" | "classic_exp" => Some(CLASSIC),
        "classic_ts" => Some(CLASSIC_TS),
        _ => None,
    }
}

/// Expand bundle names into member statistics, merge with literal tokens, and
/// deduplicate into an ordered set. Ordering makes downstream output column
/// production deterministic.
pub fn expand_statistics<'a, I>(tokens: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut expanded = BTreeSet::new();
    for token in tokens {
        match bundle_members(token) {
            Some(members) => expanded.extend(members.iter().map(|&m| m.to_owned())),
            None => {
                expanded.insert(token.to_owned());
            }
        }
    }
    expanded
}
