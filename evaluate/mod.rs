//! # Evaluation: Performance by Bucket
//!
//! Model predictions joined back onto prediction times are split into buckets (age,
//! time to event, sex, calendar position) and a metric is computed per bucket,
//! optionally with a bootstrap confidence interval.

pub mod bucket;
pub mod data;
pub mod metrics;

use crate::binning::BinningError;
use crate::errors::FlattenError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("Input lengths differ: expected {expected} rows, found {found}.")]
    LengthMismatch { expected: usize, found: usize },
    #[error("The evaluation dataset has no rows.")]
    Empty,
    #[error("Confidence level must lie strictly between 0 and 1, got {0}.")]
    InvalidConfidence(f64),
    #[error("Bucketing by {0} needs a column that was not loaded.")]
    MissingColumn(&'static str),
    #[error("Unknown metric '{0}'.")]
    UnknownMetric(String),
    #[error("Binning failed: {0}")]
    Binning(#[from] BinningError),
    #[error("Failed to load the evaluation dataset: {0}")]
    Load(#[from] FlattenError),
    #[error("Failed to write the performance table: {0}")]
    Csv(#[from] csv::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub use bucket::{BootstrapConfig, BucketOptions, BucketPerformance, performance_by_bucket};
pub use data::{EvaluationColumns, EvaluationDataset};
pub use metrics::Metric;
