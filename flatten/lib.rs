#![deny(unused_variables)]
#![deny(dead_code)]

pub mod aggregate;
pub mod cache;
pub mod columns;
pub mod config;
pub mod dataset;
pub mod describe;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod io;
pub mod outcome;
pub mod parallel;
pub mod pipeline;
pub mod progress;
pub mod spec;
pub mod split;
pub mod types;

#[path = "../shared/binning.rs"]
pub mod binning;

#[path = "../evaluate/mod.rs"]
pub mod evaluate;

pub use engine::{FeatureSet, FlattenOptions, Flattener, flatten};
pub use errors::{ConfigurationError, FlattenError};
pub use filter::filter_prediction_times;
pub use spec::{Aggregation, ColumnPrefix, Direction, TemporalSpec};
pub use types::{EventTable, PredictionTimes, SourceRegistry};
