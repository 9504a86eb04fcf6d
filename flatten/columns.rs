//! # Column Metadata and the Column-Name Codec
//!
//! Every resolved column carries a `ColumnMetadata` record. The column name is a
//! serialization of that record:
//!
//! `{prefix}_{feature}_within_{days}_days_{aggregation}_fallback_{fallback}[_dichotomous]`
//!
//! Downstream tooling may either parse names (`ColumnMetadata::decode`) or read the
//! metadata table written next to the dataset. Static columns are `{prefix}_{feature}`.

use crate::errors::ConfigurationError;
use crate::spec::{Aggregation, ColumnPrefix, Direction};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static WINDOWED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(pred|outc|eval)_(.+)_within_(\d+)_days_(.+)_fallback_(.+?)(_dichotomous)?$")
        .expect("column-name pattern is a valid regex")
});
static STATIC_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(pred|outc|eval)_(.+)$").expect("column-name pattern is a valid regex")
});
static LOOK_DISTANCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"within_(\d+)_days").expect("column-name pattern is a valid regex")
});
static AGGREGATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"days_(.*)_fallback").expect("column-name pattern is a valid regex")
});

const DICHOTOMOUS_SUFFIX: &str = "_dichotomous";

/// The window half of a column's metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowMetadata {
    pub direction: Direction,
    pub interval_days: u32,
    pub aggregation: Aggregation,
    pub fallback: f64,
    pub incident: bool,
}

/// Structured description of one resolved column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    pub name: String,
    pub prefix: ColumnPrefix,
    pub feature_name: String,
    #[serde(default)]
    pub window: Option<WindowMetadata>,
}

/// Renders a fallback the way it appears in column names: `nan`, `0`, `-1`, `0.5`.
pub fn format_fallback(fallback: f64) -> String {
    if fallback.is_nan() {
        "nan".to_string()
    } else if fallback.fract() == 0.0 && fallback.abs() < 1e15 {
        format!("{}", fallback as i64)
    } else {
        format!("{fallback}")
    }
}

fn parse_fallback(token: &str) -> Option<f64> {
    if token.eq_ignore_ascii_case("nan") {
        Some(f64::NAN)
    } else {
        token.parse().ok()
    }
}

impl ColumnMetadata {
    pub fn windowed(prefix: ColumnPrefix, feature_name: &str, window: WindowMetadata) -> Self {
        let suffix = if window.incident { DICHOTOMOUS_SUFFIX } else { "" };
        let name = format!(
            "{prefix}_{feature_name}_within_{}_days_{}_fallback_{}{suffix}",
            window.interval_days,
            window.aggregation,
            format_fallback(window.fallback)
        );
        Self {
            name,
            prefix,
            feature_name: feature_name.to_string(),
            window: Some(window),
        }
    }

    pub fn static_column(prefix: ColumnPrefix, feature_name: &str) -> Self {
        Self {
            name: format!("{prefix}_{feature_name}"),
            prefix,
            feature_name: feature_name.to_string(),
            window: None,
        }
    }

    /// Recovers metadata from a column name.
    ///
    /// Direction is not part of the name: `pred` columns decode as lookbehind and
    /// `outc`/`eval` columns as lookahead.
    pub fn decode(name: &str) -> Option<Self> {
        if let Some(caps) = WINDOWED_NAME.captures(name) {
            let prefix = ColumnPrefix::parse(&caps[1])?;
            let interval_days = caps[3].parse().ok()?;
            let aggregation = Aggregation::parse(&caps[4])?;
            let fallback = parse_fallback(&caps[5])?;
            let direction = match prefix {
                ColumnPrefix::Pred => Direction::Behind,
                ColumnPrefix::Outc | ColumnPrefix::Eval => Direction::Ahead,
            };
            return Some(Self {
                name: name.to_string(),
                prefix,
                feature_name: caps[2].to_string(),
                window: Some(WindowMetadata {
                    direction,
                    interval_days,
                    aggregation,
                    fallback,
                    incident: caps.get(6).is_some(),
                }),
            });
        }
        let caps = STATIC_NAME.captures(name)?;
        Some(Self {
            name: name.to_string(),
            prefix: ColumnPrefix::parse(&caps[1])?,
            feature_name: caps[2].to_string(),
            window: None,
        })
    }

    pub fn is_predictor(&self) -> bool {
        self.prefix == ColumnPrefix::Pred
    }

    pub fn is_outcome(&self) -> bool {
        self.prefix == ColumnPrefix::Outc
    }

    pub fn interval_days(&self) -> Option<u32> {
        self.window.map(|w| w.interval_days)
    }
}

/// The look distance embedded in a column name.
pub fn infer_look_distance(column_name: &str) -> Option<u32> {
    LOOK_DISTANCE
        .captures(column_name)
        .and_then(|caps| caps[1].parse().ok())
}

/// The aggregation function embedded in a column name.
pub fn infer_aggregation(column_name: &str) -> Option<Aggregation> {
    AGGREGATION
        .captures(column_name)
        .and_then(|caps| Aggregation::parse(&caps[1]))
}

pub fn predictor_columns(metadata: &[ColumnMetadata]) -> Vec<&ColumnMetadata> {
    metadata.iter().filter(|m| m.is_predictor()).collect()
}

pub fn outcome_columns(metadata: &[ColumnMetadata]) -> Vec<&ColumnMetadata> {
    metadata.iter().filter(|m| m.is_outcome()).collect()
}

/// Picks the single outcome column used as the training target.
///
/// Candidates are outcome columns with the requested lookahead and, when given,
/// the requested feature name. Exactly one must remain.
pub fn select_outcome_column<'a>(
    metadata: &'a [ColumnMetadata],
    lookahead_days: u32,
    feature_name: Option<&str>,
) -> Result<&'a ColumnMetadata, ConfigurationError> {
    let candidates: Vec<&ColumnMetadata> = outcome_columns(metadata)
        .into_iter()
        .filter(|m| m.interval_days() == Some(lookahead_days))
        .filter(|m| feature_name.is_none_or(|name| m.feature_name == name))
        .collect();

    let criteria = match feature_name {
        Some(name) => format!("outcome '{name}' with a {lookahead_days}-day lookahead"),
        None => format!("an outcome with a {lookahead_days}-day lookahead"),
    };
    match candidates.as_slice() {
        [] => Err(ConfigurationError::NoMatchingColumn(criteria)),
        [single] => Ok(*single),
        many => Err(ConfigurationError::AmbiguousColumn {
            criteria,
            candidates: many.iter().map(|m| m.name.clone()).collect(),
        }),
    }
}
