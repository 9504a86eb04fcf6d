//! # Error Taxonomy
//!
//! Every failure the flattening engine can surface. Configuration problems and
//! data-quality violations abort a run immediately; nothing downstream catches
//! and continues past them.

use polars::prelude::PolarsError;
use thiserror::Error;

/// A malformed or contradictory run configuration or specification.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error(
        "Quarantine filtering needs both quarantine events and an interval in days (events supplied: {has_events}, interval_days: {interval_days:?})."
    )]
    QuarantineIncomplete {
        has_events: bool,
        interval_days: Option<u32>,
    },
    #[error("More than one column matches {criteria}: {candidates:?}")]
    AmbiguousColumn {
        criteria: String,
        candidates: Vec<String>,
    },
    #[error("No column matches {0}")]
    NoMatchingColumn(String),
    #[error("Invalid specification for '{column}': {reason}")]
    InvalidSpec { column: String, reason: String },
    #[error("Source '{0}' is referenced by a specification but was never loaded.")]
    UnknownSource(String),
    #[error("Split proportions must be non-negative and sum to 1.0 (got a sum of {0}).")]
    InvalidSplit(f64),
    #[error("Failed to parse the TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

/// The crate-level error type for loading, filtering, flattening and persisting.
#[derive(Error, Debug)]
pub enum FlattenError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(
        "Column '{column}' was filled with its fallback value in {observed:.4} of rows, above the allowed proportion of {allowed:.4}."
    )]
    DataQuality {
        column: String,
        observed: f64,
        allowed: f64,
    },
    #[error("Table '{table}' is missing the required columns {missing:?}.")]
    Schema { table: String, missing: Vec<String> },
    #[error(
        "Column '{column}' in table '{table}' could not be read as {expected} (found type: {found})."
    )]
    ColumnWrongType {
        table: String,
        column: String,
        expected: &'static str,
        found: String,
    },
    #[error("Column '{column}' in table '{table}' contains {count} missing values.")]
    NullValues {
        table: String,
        column: String,
        count: usize,
    },
    #[error("Could not parse '{value}' in column '{column}' of table '{table}' as a timestamp.")]
    UnparseableTimestamp {
        table: String,
        column: String,
        value: String,
    },
    #[error("Table '{table}' was built from columns of different lengths.")]
    LengthMismatch { table: String },
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    Polars(#[from] PolarsError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to write a delimited report: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to serialize a TOML report: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Failed to build the worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}
