//! # Feature Description and Integrity Report
//!
//! Two human-readable artifacts written next to every persisted dataset: a TSV with
//! one line per column, and a TOML integrity report summarising the splits.

use crate::columns::{outcome_columns, predictor_columns};
use crate::dataset::FlattenedDataset;
use crate::errors::FlattenError;
use crate::split::Split;
use crate::types::{EntityId, FeatureColumn};
use ahash::{AHashMap, AHashSet};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnDescription {
    pub column: String,
    pub feature: String,
    pub prefix: String,
    pub direction: Option<String>,
    pub interval_days: Option<u32>,
    pub aggregation: Option<String>,
    pub fallback: Option<f64>,
    pub fallback_proportion: f64,
    pub mean: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub n_unique: usize,
}

pub fn describe_columns(dataset: &FlattenedDataset) -> Vec<ColumnDescription> {
    dataset
        .columns()
        .iter()
        .map(|column| {
            let metadata = &column.metadata;
            let window = metadata.window.as_ref();
            let (mean, min, max) = numeric_summary(&column.values);
            ColumnDescription {
                column: metadata.name.clone(),
                feature: metadata.feature_name.clone(),
                prefix: metadata.prefix.to_string(),
                direction: window.map(|w| w.direction.to_string()),
                interval_days: window.map(|w| w.interval_days),
                aggregation: window.map(|w| w.aggregation.to_string()),
                fallback: window.map(|w| w.fallback),
                fallback_proportion: column.fallback_proportion,
                mean,
                min,
                max,
                n_unique: count_unique(&column.values),
            }
        })
        .collect()
}

/// Mean, min and max over the non-NaN values of a numeric column.
fn numeric_summary(values: &FeatureColumn) -> (Option<f64>, Option<f64>, Option<f64>) {
    let Some(numbers) = values.as_numeric() else {
        return (None, None, None);
    };
    let finite: Vec<f64> = numbers.iter().copied().filter(|x| !x.is_nan()).collect();
    if finite.is_empty() {
        return (None, None, None);
    }
    let mean = finite.iter().sum::<f64>() / finite.len() as f64;
    let min = finite.iter().copied().fold(f64::INFINITY, f64::min);
    let max = finite.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    (Some(mean), Some(min), Some(max))
}

fn count_unique(values: &FeatureColumn) -> usize {
    match values {
        FeatureColumn::Numeric(v) => v
            .iter()
            .filter(|x| !x.is_nan())
            .map(|x| x.to_bits())
            .collect::<AHashSet<u64>>()
            .len(),
        FeatureColumn::Text(v) => v.iter().flatten().collect::<AHashSet<&String>>().len(),
    }
}

pub fn write_description_tsv(descriptions: &[ColumnDescription], path: &Path) -> Result<(), FlattenError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    for description in descriptions {
        writer.serialize(description)?;
    }
    writer.flush()?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitSummary {
    pub split: Split,
    pub n_rows: usize,
    pub n_entities: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub n_rows: usize,
    pub n_predictor_columns: usize,
    pub n_outcome_columns: usize,
    pub n_other_columns: usize,
    pub duplicated_pred_time_uuids: usize,
    /// Entities found in more than one split. Anything but zero is a leak.
    pub entities_in_multiple_splits: usize,
    pub splits: Vec<SplitSummary>,
}

impl IntegrityReport {
    /// `assignment[row]` is the split of each dataset row.
    pub fn build(dataset: &FlattenedDataset, assignment: &[Split]) -> Self {
        let metadata = dataset.metadata();
        let n_predictor_columns = predictor_columns(&metadata).len();
        let n_outcome_columns = outcome_columns(&metadata).len();

        let uuids = dataset.prediction_times().uuids();
        let unique_uuids: AHashSet<&String> = uuids.iter().collect();

        let mut splits_per_entity: AHashMap<EntityId, AHashSet<Split>> = AHashMap::new();
        let mut rows_per_split: AHashMap<Split, usize> = AHashMap::new();
        let mut entities_per_split: AHashMap<Split, AHashSet<EntityId>> = AHashMap::new();
        for (&entity, &split) in dataset.prediction_times().entity_ids().iter().zip(assignment) {
            splits_per_entity.entry(entity).or_default().insert(split);
            *rows_per_split.entry(split).or_default() += 1;
            entities_per_split.entry(split).or_default().insert(entity);
        }

        Self {
            n_rows: dataset.len(),
            n_predictor_columns,
            n_outcome_columns,
            n_other_columns: metadata.len() - n_predictor_columns - n_outcome_columns,
            duplicated_pred_time_uuids: uuids.len() - unique_uuids.len(),
            entities_in_multiple_splits: splits_per_entity.values().filter(|s| s.len() > 1).count(),
            splits: Split::ALL
                .iter()
                .map(|&split| SplitSummary {
                    split,
                    n_rows: rows_per_split.get(&split).copied().unwrap_or(0),
                    n_entities: entities_per_split.get(&split).map_or(0, |e| e.len()),
                })
                .collect(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), FlattenError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }
}
