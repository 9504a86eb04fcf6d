//! # Entity-Level Splitting and Persistence
//!
//! Rows are split by entity, never by row, so no entity can leak from the training
//! split into evaluation. The assignment is a pure function of the set of entities,
//! the proportions and the seed.

use crate::columns::ColumnMetadata;
use crate::dataset::FlattenedDataset;
use crate::describe::{IntegrityReport, describe_columns, write_description_tsv};
use crate::errors::{ConfigurationError, FlattenError};
use crate::io::write_parquet;
use crate::types::EntityId;
use ahash::AHashMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;

pub const COLUMN_METADATA_FILE: &str = "column_metadata.toml";
pub const FEATURE_DESCRIPTION_FILE: &str = "feature_description.tsv";
pub const INTEGRITY_REPORT_FILE: &str = "integrity_report.toml";

const PROPORTION_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn default_seed() -> u64 {
    42
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SplitConfig {
    pub train: f64,
    pub val: f64,
    pub test: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for SplitConfig {
    fn default() -> Self {
        Self {
            train: 0.7,
            val: 0.15,
            test: 0.15,
            seed: default_seed(),
        }
    }
}

impl SplitConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let total = self.train + self.val + self.test;
        let negative = [self.train, self.val, self.test].iter().any(|p| *p < 0.0 || p.is_nan());
        if negative || (total - 1.0).abs() > PROPORTION_TOLERANCE {
            return Err(ConfigurationError::InvalidSplit(total));
        }
        Ok(())
    }

    /// Assigns every distinct entity to one split.
    ///
    /// Entities are sorted, shuffled with the seed, then cut at the cumulative
    /// proportions, so the result does not depend on row order.
    pub fn assign_entities(&self, entity_ids: &[EntityId]) -> Result<AHashMap<EntityId, Split>, ConfigurationError> {
        self.validate()?;
        let mut entities: Vec<EntityId> = entity_ids.to_vec();
        entities.sort_unstable();
        entities.dedup();
        let mut rng = StdRng::seed_from_u64(self.seed);
        entities.shuffle(&mut rng);

        let n = entities.len() as f64;
        let train_end = (self.train * n).round() as usize;
        let val_end = ((self.train + self.val) * n).round() as usize;
        Ok(entities
            .into_iter()
            .enumerate()
            .map(|(i, entity)| {
                let split = if i < train_end {
                    Split::Train
                } else if i < val_end {
                    Split::Val
                } else {
                    Split::Test
                };
                (entity, split)
            })
            .collect())
    }

    /// The split of every row of `entity_ids`.
    pub fn assign_rows(&self, entity_ids: &[EntityId]) -> Result<Vec<Split>, ConfigurationError> {
        let by_entity = self.assign_entities(entity_ids)?;
        Ok(entity_ids
            .iter()
            .map(|e| by_entity.get(e).copied().unwrap_or(Split::Test))
            .collect())
    }
}

/// Row indices of every split, in dataset order.
pub fn rows_by_split(assignment: &[Split]) -> AHashMap<Split, Vec<usize>> {
    let mut rows: AHashMap<Split, Vec<usize>> = Split::ALL.iter().map(|&s| (s, Vec::new())).collect();
    for (row, split) in assignment.iter().enumerate() {
        rows.entry(*split).or_default().push(row);
    }
    rows
}

#[derive(Serialize)]
struct MetadataFile<'a> {
    columns: &'a [ColumnMetadata],
}

/// Writes `{train,val,test}.parquet`, the column metadata, the feature description
/// and the integrity report into `dir`.
pub fn write_splits(dataset: &FlattenedDataset, config: &SplitConfig, dir: &Path) -> Result<IntegrityReport, FlattenError> {
    fs::create_dir_all(dir)?;
    let assignment = config.assign_rows(dataset.prediction_times().entity_ids())?;
    let rows = rows_by_split(&assignment);

    for split in Split::ALL {
        let subset = dataset.select_rows(rows.get(&split).map_or(&[][..], |r| r.as_slice()));
        let mut df = subset.to_dataframe()?;
        let path = dir.join(format!("{split}.parquet"));
        write_parquet(&mut df, &path)?;
        log::info!("Wrote {} rows to {}", subset.len(), path.display());
    }

    let metadata = dataset.metadata();
    let metadata_toml = toml::to_string_pretty(&MetadataFile { columns: &metadata })?;
    fs::write(dir.join(COLUMN_METADATA_FILE), metadata_toml)?;

    write_description_tsv(&describe_columns(dataset), &dir.join(FEATURE_DESCRIPTION_FILE))?;

    let report = IntegrityReport::build(dataset, &assignment);
    report.save(&dir.join(INTEGRITY_REPORT_FILE))?;
    if report.entities_in_multiple_splits > 0 || report.duplicated_pred_time_uuids > 0 {
        log::warn!(
            "Integrity check: {} entities in several splits, {} duplicated prediction times",
            report.entities_in_multiple_splits,
            report.duplicated_pred_time_uuids
        );
    }
    Ok(report)
}

/// Reads back a `column_metadata.toml`.
pub fn load_column_metadata(path: &Path) -> Result<Vec<ColumnMetadata>, FlattenError> {
    #[derive(Deserialize)]
    struct Owned {
        columns: Vec<ColumnMetadata>,
    }
    let text = fs::read_to_string(path)?;
    let parsed: Owned = toml::from_str(&text).map_err(ConfigurationError::from)?;
    Ok(parsed.columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columns::WindowMetadata;
    use crate::dataset::FlattenedColumn;
    use crate::io::read_table;
    use crate::spec::{Aggregation, ColumnPrefix, Direction};
    use crate::types::test_support::day;
    use crate::types::{FeatureColumn, PredictionTimes};
    use tempfile::tempdir;

    #[test]
    fn proportions_must_sum_to_one() {
        let bad = SplitConfig {
            train: 0.8,
            val: 0.3,
            test: 0.0,
            seed: 1,
        };
        assert!(matches!(bad.validate(), Err(ConfigurationError::InvalidSplit(_))));
        assert!(SplitConfig::default().validate().is_ok());
    }

    #[test]
    fn entities_never_span_splits_and_assignment_is_reproducible() {
        let ids: Vec<EntityId> = (0..200).flat_map(|e| [e, e, e]).collect();
        let config = SplitConfig::default();
        let rows = config.assign_rows(&ids).unwrap();
        for chunk in rows.chunks(3) {
            assert!(chunk.iter().all(|s| *s == chunk[0]));
        }
        let train = rows.iter().filter(|s| **s == Split::Train).count() / 3;
        assert_eq!(train, 140);

        let mut reversed = ids.clone();
        reversed.reverse();
        let by_entity = config.assign_entities(&ids).unwrap();
        assert_eq!(config.assign_entities(&reversed).unwrap(), by_entity);
    }

    #[test]
    fn write_splits_produces_every_artifact() {
        let times = PredictionTimes::from_pairs(&(0..20).map(|e| (e, day(e))).collect::<Vec<_>>());
        let window = WindowMetadata {
            direction: Direction::Behind,
            interval_days: 10,
            aggregation: Aggregation::Count,
            fallback: f64::NAN,
            incident: false,
        };
        let dataset = FlattenedDataset::new(
            times,
            vec![FlattenedColumn {
                metadata: ColumnMetadata::windowed(ColumnPrefix::Pred, "visits", window),
                values: FeatureColumn::Numeric((0..20u32).map(f64::from).collect()),
                fallback_proportion: 0.0,
            }],
        );
        let dir = tempdir().unwrap();
        let report = write_splits(&dataset, &SplitConfig::default(), dir.path()).unwrap();

        let total: usize = Split::ALL
            .iter()
            .map(|s| read_table(&dir.path().join(format!("{s}.parquet"))).unwrap().height())
            .sum();
        assert_eq!(total, 20);
        assert_eq!(report.entities_in_multiple_splits, 0);
        assert!(dir.path().join(FEATURE_DESCRIPTION_FILE).exists());
        assert!(dir.path().join(INTEGRITY_REPORT_FILE).exists());

        let metadata = load_column_metadata(&dir.path().join(COLUMN_METADATA_FILE)).unwrap();
        assert_eq!(metadata.len(), 1);
        assert_eq!(metadata[0].name, "pred_visits_within_10_days_count_fallback_nan");
        assert_eq!(metadata[0].window.unwrap().interval_days, 10);
    }
}
