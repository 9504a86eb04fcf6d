use std::fmt;

/// Stages reported while flattening.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FlattenStage {
    Indexing,
    Aggregation,
    StaticFeatures,
}

impl FlattenStage {
    pub fn describe(self) -> &'static str {
        match self {
            Self::Indexing => "event table indexing",
            Self::Aggregation => "windowed aggregation",
            Self::StaticFeatures => "static feature joins",
        }
    }
}

impl fmt::Display for FlattenStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// Observer for reporting progress while flattening. Units of one stage finish
/// concurrently, so every callback takes `&self`.
pub trait FlattenProgressObserver: Sync {
    fn on_stage_start(&self, stage: FlattenStage, total_units: usize) {
        let _ = (stage, total_units);
    }
    fn on_unit_finish(&self, stage: FlattenStage, unit: &str) {
        let _ = (stage, unit);
    }
    fn on_stage_finish(&self, stage: FlattenStage) {
        let _ = stage;
    }
}

#[derive(Default)]
pub struct NoopFlattenProgress;

impl FlattenProgressObserver for NoopFlattenProgress {}
