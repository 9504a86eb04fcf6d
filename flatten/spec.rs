//! # Feature and Outcome Specifications
//!
//! Declarative descriptions of derived columns. A `TemporalSpec` describes one
//! windowed column; the group specs expand a grid of sources, windows and
//! aggregation functions into many `TemporalSpec`s. Specs are pure data and carry
//! no reference to the tables they will be resolved against.

use crate::columns::{ColumnMetadata, WindowMetadata};
use crate::errors::ConfigurationError;
use crate::types::ValueKind;
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the prediction time a window extends to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// `(t - W, t]`: the prediction instant itself is known.
    Behind,
    /// `(t, t + W]`.
    Ahead,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Behind => "behind",
            Self::Ahead => "ahead",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The role of a column, encoded as the first token of its name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnPrefix {
    Pred,
    Outc,
    Eval,
}

impl ColumnPrefix {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pred => "pred",
            Self::Outc => "outc",
            Self::Eval => "eval",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "pred" => Some(Self::Pred),
            "outc" => Some(Self::Outc),
            "eval" => Some(Self::Eval),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the events inside one window collapse into a single value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    Max,
    Min,
    Mean,
    Sum,
    Latest,
    Earliest,
    Count,
    Bool,
    Variance,
    ChangePerDay,
    Concatenate,
}

impl Aggregation {
    pub const ALL: [Aggregation; 11] = [
        Self::Max,
        Self::Min,
        Self::Mean,
        Self::Sum,
        Self::Latest,
        Self::Earliest,
        Self::Count,
        Self::Bool,
        Self::Variance,
        Self::ChangePerDay,
        Self::Concatenate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Max => "max",
            Self::Min => "min",
            Self::Mean => "mean",
            Self::Sum => "sum",
            Self::Latest => "latest",
            Self::Earliest => "earliest",
            Self::Count => "count",
            Self::Bool => "bool",
            Self::Variance => "variance",
            Self::ChangePerDay => "change_per_day",
            Self::Concatenate => "concatenate",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.as_str() == token)
    }

    /// `count` of an empty window is a genuine zero and is never replaced by the fallback.
    pub fn never_falls_back(self) -> bool {
        matches!(self, Self::Count)
    }

    pub fn accepts(self, kind: ValueKind) -> bool {
        match self {
            Self::Latest | Self::Earliest | Self::Count | Self::Bool => true,
            Self::Concatenate => kind == ValueKind::Text,
            Self::Max | Self::Min | Self::Mean | Self::Sum | Self::Variance | Self::ChangePerDay => {
                kind == ValueKind::Numeric
            }
        }
    }

    /// The kind of the resolved column given the kind of the source values.
    pub fn output_kind(self, source: ValueKind) -> ValueKind {
        match self {
            Self::Concatenate => ValueKind::Text,
            Self::Latest | Self::Earliest => source,
            _ => ValueKind::Numeric,
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Longest window a spec may ask for, a little over a century.
pub const MAX_INTERVAL_DAYS: u32 = 40_000;

pub(crate) fn default_fallback_nan() -> f64 {
    f64::NAN
}

pub(crate) fn default_fallback_zero() -> f64 {
    0.0
}

pub(crate) fn default_allowed_nan_value_prop() -> f64 {
    1.0
}

/// One windowed column.
#[derive(Debug, Clone, PartialEq)]
pub struct TemporalSpec {
    /// Name of the event table in the `SourceRegistry`.
    pub source: String,
    /// Name embedded in the column; defaults to `source`.
    pub feature_name: String,
    pub prefix: ColumnPrefix,
    pub direction: Direction,
    pub interval_days: u32,
    pub aggregation: Aggregation,
    pub fallback: f64,
    /// Upper bound on the proportion of rows that may receive the fallback.
    pub allowed_nan_value_prop: f64,
    pub incident: bool,
}

impl TemporalSpec {
    pub fn predictor(
        source: impl Into<String>,
        interval_days: u32,
        aggregation: Aggregation,
        fallback: f64,
    ) -> Self {
        let source = source.into();
        Self {
            feature_name: source.clone(),
            source,
            prefix: ColumnPrefix::Pred,
            direction: Direction::Behind,
            interval_days,
            aggregation,
            fallback,
            allowed_nan_value_prop: default_allowed_nan_value_prop(),
            incident: false,
        }
    }

    pub fn outcome(
        source: impl Into<String>,
        interval_days: u32,
        aggregation: Aggregation,
        fallback: f64,
        incident: bool,
    ) -> Self {
        let source = source.into();
        Self {
            feature_name: source.clone(),
            source,
            prefix: ColumnPrefix::Outc,
            direction: Direction::Ahead,
            interval_days,
            aggregation,
            fallback,
            allowed_nan_value_prop: default_allowed_nan_value_prop(),
            incident,
        }
    }

    pub fn with_feature_name(mut self, name: impl Into<String>) -> Self {
        self.feature_name = name.into();
        self
    }

    pub fn with_prefix(mut self, prefix: ColumnPrefix) -> Self {
        self.prefix = prefix;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_allowed_nan_value_prop(mut self, prop: f64) -> Self {
        self.allowed_nan_value_prop = prop;
        self
    }

    pub fn metadata(&self) -> ColumnMetadata {
        ColumnMetadata::windowed(
            self.prefix,
            &self.feature_name,
            WindowMetadata {
                direction: self.direction,
                interval_days: self.interval_days,
                aggregation: self.aggregation,
                fallback: self.fallback,
                incident: self.incident,
            },
        )
    }

    pub fn column_name(&self) -> String {
        self.metadata().name
    }

    /// Checks the spec against the kind of values its source holds.
    pub fn validate(&self, source_kind: ValueKind) -> Result<(), ConfigurationError> {
        let invalid = |reason: String| ConfigurationError::InvalidSpec {
            column: self.column_name(),
            reason,
        };
        if self.interval_days == 0 {
            return Err(invalid("the window must span at least one day".to_string()));
        }
        if self.interval_days > MAX_INTERVAL_DAYS {
            return Err(invalid(format!(
                "the window may span at most {MAX_INTERVAL_DAYS} days, got {}",
                self.interval_days
            )));
        }
        if !(0.0..=1.0).contains(&self.allowed_nan_value_prop) {
            return Err(invalid(format!(
                "allowed_nan_value_prop must lie in [0, 1], got {}",
                self.allowed_nan_value_prop
            )));
        }
        if self.incident && self.direction != Direction::Ahead {
            return Err(invalid(
                "incident resolution only applies to lookahead windows".to_string(),
            ));
        }
        if !self.aggregation.accepts(source_kind) {
            return Err(invalid(format!(
                "'{}' cannot aggregate {:?} values",
                self.aggregation, source_kind
            )));
        }
        if self.aggregation.output_kind(source_kind) == ValueKind::Text && !self.fallback.is_nan() {
            return Err(invalid(
                "text columns can only fall back to a missing value (nan)".to_string(),
            ));
        }
        Ok(())
    }
}

/// A grid of predictor columns: every source × window × aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PredictorGroupSpec {
    pub sources: Vec<String>,
    pub interval_days: Vec<u32>,
    pub aggregations: Vec<Aggregation>,
    #[serde(default = "default_fallback_nan")]
    pub fallback: f64,
    #[serde(default = "default_allowed_nan_value_prop")]
    pub allowed_nan_value_prop: f64,
    /// `eval` marks columns that are carried for evaluation but never trained on.
    #[serde(default)]
    pub prefix: Option<ColumnPrefix>,
}

impl PredictorGroupSpec {
    pub fn expand(&self) -> Vec<TemporalSpec> {
        iproduct!(&self.sources, &self.interval_days, &self.aggregations)
            .map(|(source, &days, &aggregation)| {
                TemporalSpec::predictor(source.clone(), days, aggregation, self.fallback)
                    .with_prefix(self.prefix.unwrap_or(ColumnPrefix::Pred))
                    .with_allowed_nan_value_prop(self.allowed_nan_value_prop)
            })
            .collect()
    }
}

/// A grid of outcome columns: every source × lookahead × aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutcomeGroupSpec {
    pub sources: Vec<String>,
    pub interval_days: Vec<u32>,
    pub aggregations: Vec<Aggregation>,
    #[serde(default = "default_fallback_zero")]
    pub fallback: f64,
    #[serde(default = "default_allowed_nan_value_prop")]
    pub allowed_nan_value_prop: f64,
    #[serde(default)]
    pub incident: bool,
}

impl OutcomeGroupSpec {
    pub fn expand(&self) -> Vec<TemporalSpec> {
        iproduct!(&self.sources, &self.interval_days, &self.aggregations)
            .map(|(source, &days, &aggregation)| {
                TemporalSpec::outcome(source.clone(), days, aggregation, self.fallback, self.incident)
                    .with_allowed_nan_value_prop(self.allowed_nan_value_prop)
            })
            .collect()
    }
}
