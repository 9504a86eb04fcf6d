// ========================================================================================
//
//                      THE FLATTENER: PREDICTION TIMES -> WIDE TABLE
//
// ========================================================================================
//
// The flattener owns the order of operations for one run:
//
// 1.  **Validation:** every spec must name a loaded source whose values it can
//     aggregate, and resolved column names must be unique.
// 2.  **Row policy:** prediction times without sufficient look distance and, for
//     incident outcomes, prediction times at or after the first outcome are removed.
//     These are the only rows ever dropped here, and both drops are logged.
// 3.  **Resolution:** every spec is an independent unit mapped on the worker pool.
//     Results are assembled in spec order, so completion order never matters.
// 4.  **Quality gate:** a column whose fallback proportion exceeds its allowance
//     aborts the run, naming the column and the observed proportion.

use crate::aggregate::{EntityIndex, ResolvedColumn, days_after, days_before, resolve_column};
use crate::cache::{CacheKey, FeatureCache};
use crate::columns::ColumnMetadata;
use crate::dataset::{FlattenedColumn, FlattenedDataset};
use crate::errors::{ConfigurationError, FlattenError};
use crate::outcome::drop_after_incident_outcomes;
use crate::parallel::WorkerPool;
use crate::progress::{FlattenProgressObserver, FlattenStage, NoopFlattenProgress};
use crate::spec::{ColumnPrefix, Direction, TemporalSpec};
use crate::types::{
    BirthdateTable, EntityId, FeatureColumn, PredictionTimes, SourceRegistry, StaticTable, Timestamp,
    ValueColumn,
};
use ahash::{AHashMap, AHashSet};
use std::sync::Arc;

pub const AGE_FEATURE_NAME: &str = "age_in_years";
const DAYS_PER_YEAR: f64 = 365.25;

/// Row-policy and scheduling switches for one run.
#[derive(Debug, Clone)]
pub struct FlattenOptions {
    /// Drop prediction times whose lookbehind window starts before the source's first event.
    pub drop_insufficient_lookbehind: bool,
    /// Drop prediction times whose lookahead window ends after the source's last event.
    pub drop_insufficient_lookahead: bool,
    pub n_workers: Option<usize>,
}

impl Default for FlattenOptions {
    fn default() -> Self {
        Self {
            drop_insufficient_lookbehind: true,
            drop_insufficient_lookahead: true,
            n_workers: None,
        }
    }
}

/// Everything to derive for one run.
#[derive(Debug, Clone, Default)]
pub struct FeatureSet {
    pub temporal: Vec<TemporalSpec>,
    pub statics: Vec<StaticTable>,
    pub birthdates: Option<BirthdateTable>,
}

impl FeatureSet {
    pub fn from_specs(temporal: Vec<TemporalSpec>) -> Self {
        Self {
            temporal,
            ..Self::default()
        }
    }
}

/// The pure function boundary: prediction times and specs in, wide table out.
pub fn flatten(
    prediction_times: &PredictionTimes,
    sources: &SourceRegistry,
    specs: &[TemporalSpec],
    options: FlattenOptions,
) -> Result<FlattenedDataset, FlattenError> {
    Flattener::new(sources, options)?.flatten(prediction_times, &FeatureSet::from_specs(specs.to_vec()))
}

pub struct Flattener<'a> {
    sources: &'a SourceRegistry,
    options: FlattenOptions,
    pool: WorkerPool,
    cache: Option<&'a FeatureCache>,
    progress: &'a dyn FlattenProgressObserver,
}

static NOOP_PROGRESS: NoopFlattenProgress = NoopFlattenProgress;

impl<'a> Flattener<'a> {
    pub fn new(sources: &'a SourceRegistry, options: FlattenOptions) -> Result<Self, FlattenError> {
        let pool = WorkerPool::new(options.n_workers)?;
        Ok(Self {
            sources,
            options,
            pool,
            cache: None,
            progress: &NOOP_PROGRESS,
        })
    }

    pub fn with_cache(mut self, cache: &'a FeatureCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn FlattenProgressObserver) -> Self {
        self.progress = progress;
        self
    }

    pub fn flatten(&self, prediction_times: &PredictionTimes, features: &FeatureSet) -> Result<FlattenedDataset, FlattenError> {
        self.validate(features)?;
        log::info!(
            "Flattening {} prediction times with {} temporal specs, {} static features{}",
            prediction_times.len(),
            features.temporal.len(),
            features.statics.len(),
            if features.birthdates.is_some() { " and age" } else { "" }
        );

        let indices = self.build_indices(&features.temporal)?;

        let rows = drop_insufficient_look_distance(
            prediction_times,
            &features.temporal,
            &indices,
            &self.options,
        );
        let incident: Vec<&EntityIndex<'_>> = unique_sources(features.temporal.iter().filter(|s| s.incident))
            .iter()
            .filter_map(|name| indices.get(name.as_str()))
            .collect();
        let rows = drop_after_incident_outcomes(&rows, &incident);

        let mut columns = self.resolve_temporal(&rows, &features.temporal, &indices)?;

        self.progress
            .on_stage_start(FlattenStage::StaticFeatures, features.statics.len());
        for table in &features.statics {
            columns.push(static_column(&rows, table));
            self.progress.on_unit_finish(FlattenStage::StaticFeatures, &table.name);
        }
        if let Some(birthdates) = &features.birthdates {
            columns.push(age_column(&rows, birthdates));
        }
        self.progress.on_stage_finish(FlattenStage::StaticFeatures);

        log::info!(
            "Flattened dataset has {} rows and {} feature columns",
            rows.len(),
            columns.len()
        );
        Ok(FlattenedDataset::new(rows, columns))
    }

    fn validate(&self, features: &FeatureSet) -> Result<(), FlattenError> {
        let mut names: AHashSet<String> = AHashSet::new();
        for spec in &features.temporal {
            let table = self.sources.get(&spec.source)?;
            spec.validate(table.values().kind())?;
            let name = spec.column_name();
            if !names.insert(name.clone()) {
                return Err(ConfigurationError::InvalidSpec {
                    column: name,
                    reason: "two specifications resolve to the same column name".to_string(),
                }
                .into());
            }
        }
        for table in &features.statics {
            let name = ColumnMetadata::static_column(ColumnPrefix::Pred, &table.name).name;
            if !names.insert(name.clone()) {
                return Err(ConfigurationError::InvalidSpec {
                    column: name,
                    reason: "two static features share a name".to_string(),
                }
                .into());
            }
        }
        if features.birthdates.is_some() {
            let name = ColumnMetadata::static_column(ColumnPrefix::Pred, AGE_FEATURE_NAME).name;
            if names.contains(&name) {
                return Err(ConfigurationError::InvalidSpec {
                    column: name,
                    reason: "a static feature collides with the derived age column".to_string(),
                }
                .into());
            }
        }
        Ok(())
    }

    fn build_indices(&self, specs: &[TemporalSpec]) -> Result<AHashMap<String, EntityIndex<'a>>, FlattenError> {
        let names = unique_sources(specs.iter());
        self.progress.on_stage_start(FlattenStage::Indexing, names.len());
        let built = self.pool.map(&names, |name| -> Result<_, FlattenError> {
            let index = EntityIndex::build(self.sources.get(name)?);
            self.progress.on_unit_finish(FlattenStage::Indexing, name);
            Ok((name.clone(), index))
        })?;
        self.progress.on_stage_finish(FlattenStage::Indexing);
        Ok(built.into_iter().collect())
    }

    fn resolve_temporal(
        &self,
        rows: &PredictionTimes,
        specs: &[TemporalSpec],
        indices: &AHashMap<String, EntityIndex<'a>>,
    ) -> Result<Vec<FlattenedColumn>, FlattenError> {
        let rows_fingerprint = rows.fingerprint();
        self.progress.on_stage_start(FlattenStage::Aggregation, specs.len());
        let columns = self.pool.map(specs, |spec| -> Result<FlattenedColumn, FlattenError> {
            let index = indices
                .get(&spec.source)
                .ok_or_else(|| ConfigurationError::UnknownSource(spec.source.clone()))?;
            let metadata = spec.metadata();
            let resolved = self.resolve_cached(index, rows, rows_fingerprint, spec, &metadata.name);

            let observed = resolved.fallback_proportion();
            if observed > spec.allowed_nan_value_prop {
                log::error!(
                    "Column '{}' fell back on {:.4} of rows (allowed {:.4})",
                    metadata.name,
                    observed,
                    spec.allowed_nan_value_prop
                );
                return Err(FlattenError::DataQuality {
                    column: metadata.name,
                    observed,
                    allowed: spec.allowed_nan_value_prop,
                });
            }
            log::debug!("Resolved '{}' (fallback proportion {:.4})", metadata.name, observed);
            self.progress.on_unit_finish(FlattenStage::Aggregation, &metadata.name);
            Ok(FlattenedColumn {
                metadata,
                values: resolved.values.clone(),
                fallback_proportion: observed,
            })
        })?;
        self.progress.on_stage_finish(FlattenStage::Aggregation);
        Ok(columns)
    }

    fn resolve_cached(
        &self,
        index: &EntityIndex<'_>,
        rows: &PredictionTimes,
        rows_fingerprint: u64,
        spec: &TemporalSpec,
        column_name: &str,
    ) -> Arc<ResolvedColumn> {
        let Some(cache) = self.cache else {
            return Arc::new(resolve_column(index, rows, spec));
        };
        let key = CacheKey {
            column_name: column_name.to_string(),
            source_fingerprint: index.table().fingerprint(),
            prediction_times_fingerprint: rows_fingerprint,
        };
        if let Some(hit) = cache.get(&key) {
            log::debug!("Cache hit for '{column_name}'");
            return hit;
        }
        let resolved = Arc::new(resolve_column(index, rows, spec));
        cache.insert(key, Arc::clone(&resolved));
        resolved
    }
}

fn unique_sources<'s>(specs: impl Iterator<Item = &'s TemporalSpec>) -> Vec<String> {
    let mut seen = AHashSet::new();
    specs
        .filter(|s| seen.insert(s.source.as_str()))
        .map(|s| s.source.clone())
        .collect()
}

/// Removes prediction times whose windows reach outside the span covered by their sources.
///
/// A fallback written there would be indistinguishable from a genuinely empty
/// window. Sources without events are skipped.
pub fn drop_insufficient_look_distance(
    prediction_times: &PredictionTimes,
    specs: &[TemporalSpec],
    indices: &AHashMap<String, EntityIndex<'_>>,
    options: &FlattenOptions,
) -> PredictionTimes {
    // Per source: the earliest admissible prediction time and the latest one.
    let mut earliest_allowed: Option<Timestamp> = None;
    let mut latest_allowed: Option<Timestamp> = None;
    for spec in specs {
        let Some((first, last)) = indices
            .get(&spec.source)
            .and_then(|index| index.table().timestamp_range())
        else {
            continue;
        };
        match spec.direction {
            Direction::Behind if options.drop_insufficient_lookbehind => {
                let bound = days_after(first, spec.interval_days);
                earliest_allowed = Some(earliest_allowed.map_or(bound, |b| b.max(bound)));
            }
            Direction::Ahead if options.drop_insufficient_lookahead => {
                let bound = days_before(last, spec.interval_days);
                latest_allowed = Some(latest_allowed.map_or(bound, |b| b.min(bound)));
            }
            _ => {}
        }
    }
    if earliest_allowed.is_none() && latest_allowed.is_none() {
        return prediction_times.clone();
    }

    let keep: Vec<bool> = prediction_times
        .timestamps()
        .iter()
        .map(|&t| earliest_allowed.is_none_or(|b| t >= b) && latest_allowed.is_none_or(|b| t <= b))
        .collect();
    let filtered = prediction_times.retain_mask(&keep);
    log::info!(
        "Insufficient look distance removed {} of {} prediction times",
        prediction_times.len() - filtered.len(),
        prediction_times.len()
    );
    filtered
}

fn static_column(rows: &PredictionTimes, table: &StaticTable) -> FlattenedColumn {
    let metadata = ColumnMetadata::static_column(ColumnPrefix::Pred, &table.name);
    let lookup: AHashMap<EntityId, usize> = table
        .entity_ids
        .iter()
        .enumerate()
        .map(|(i, &e)| (e, i))
        .collect();
    let positions: Vec<Option<usize>> = rows.entity_ids().iter().map(|e| lookup.get(e).copied()).collect();
    let missing = positions.iter().filter(|p| p.is_none()).count();
    let values = match &table.values {
        ValueColumn::Numeric(v) => {
            FeatureColumn::Numeric(positions.iter().map(|p| p.map_or(table.fallback, |i| v[i])).collect())
        }
        ValueColumn::Text(v) => {
            FeatureColumn::Text(positions.iter().map(|p| p.map(|i| v[i].clone())).collect())
        }
    };
    FlattenedColumn {
        metadata,
        values,
        fallback_proportion: proportion(missing, rows.len()),
    }
}

fn age_column(rows: &PredictionTimes, birthdates: &BirthdateTable) -> FlattenedColumn {
    let lookup: AHashMap<EntityId, Timestamp> = birthdates
        .entity_ids
        .iter()
        .copied()
        .zip(birthdates.birthdates.iter().copied())
        .collect();
    let mut missing = 0;
    let ages = rows
        .entity_ids()
        .iter()
        .zip(rows.timestamps())
        .map(|(e, &t)| match lookup.get(e) {
            Some(&born) => {
                let years = (t - born).num_seconds() as f64 / 86_400.0 / DAYS_PER_YEAR;
                (years * 100.0).round() / 100.0
            }
            None => {
                missing += 1;
                f64::NAN
            }
        })
        .collect();
    FlattenedColumn {
        metadata: ColumnMetadata::static_column(ColumnPrefix::Pred, AGE_FEATURE_NAME),
        values: FeatureColumn::Numeric(ages),
        fallback_proportion: proportion(missing, rows.len()),
    }
}

fn proportion(count: usize, total: usize) -> f64 {
    if total == 0 { 0.0 } else { count as f64 / total as f64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::Aggregation;
    use crate::types::EventTable;
    use crate::types::test_support::day;
    use approx::assert_abs_diff_eq;

    fn no_drops() -> FlattenOptions {
        FlattenOptions {
            drop_insufficient_lookbehind: false,
            drop_insufficient_lookahead: false,
            n_workers: Some(2),
        }
    }

    fn registry(tables: Vec<EventTable>) -> SourceRegistry {
        let mut registry = SourceRegistry::new();
        for t in tables {
            registry.insert(t);
        }
        registry
    }

    #[test]
    fn resolves_every_spec_in_spec_order() {
        let sources = registry(vec![EventTable::from_numeric_rows(
            "hba1c",
            &[(1, day(5), 3.0), (1, day(12), 7.0)],
        )]);
        let times = PredictionTimes::from_pairs(&[(1, day(10)), (1, day(20))]);
        let specs = vec![
            TemporalSpec::predictor("hba1c", 10, Aggregation::Mean, f64::NAN),
            TemporalSpec::predictor("hba1c", 30, Aggregation::Count, f64::NAN),
        ];
        let out = flatten(&times, &sources, &specs, no_drops()).unwrap();
        assert_eq!(out.columns().len(), 2);
        assert_eq!(
            out.columns()[0].values,
            FeatureColumn::Numeric(vec![3.0, 7.0])
        );
        assert_eq!(
            out.columns()[1].values,
            FeatureColumn::Numeric(vec![1.0, 2.0])
        );
    }

    #[test]
    fn fallback_gate_aborts_the_run_naming_the_column() {
        let sources = registry(vec![EventTable::from_numeric_rows("hba1c", &[(1, day(5), 3.0)])]);
        let times = PredictionTimes::from_pairs(&[(1, day(10)), (2, day(10)), (3, day(10)), (4, day(10))]);
        let spec = TemporalSpec::predictor("hba1c", 10, Aggregation::Max, 0.0).with_allowed_nan_value_prop(0.5);
        let err = flatten(&times, &sources, &[spec.clone()], no_drops()).unwrap_err();
        match err {
            FlattenError::DataQuality {
                column,
                observed,
                allowed,
            } => {
                assert_eq!(column, spec.column_name());
                assert_abs_diff_eq!(observed, 0.75, epsilon = 1e-12);
                assert_abs_diff_eq!(allowed, 0.5, epsilon = 1e-12);
            }
            other => panic!("expected DataQuality, got {other:?}"),
        }
    }

    #[test]
    fn count_columns_pass_a_zero_tolerance_gate() {
        let sources = registry(vec![EventTable::from_numeric_rows("visits", &[(1, day(5), 1.0)])]);
        let times = PredictionTimes::from_pairs(&[(1, day(10)), (2, day(10))]);
        let spec = TemporalSpec::predictor("visits", 10, Aggregation::Count, f64::NAN).with_allowed_nan_value_prop(0.0);
        let out = flatten(&times, &sources, &[spec], no_drops()).unwrap();
        assert_eq!(out.columns()[0].values, FeatureColumn::Numeric(vec![1.0, 0.0]));
        assert_eq!(out.columns()[0].fallback_proportion, 0.0);
    }

    #[test]
    fn unknown_sources_and_duplicate_columns_are_configuration_errors() {
        let sources = registry(vec![EventTable::from_numeric_rows("hba1c", &[(1, day(5), 3.0)])]);
        let times = PredictionTimes::from_pairs(&[(1, day(10))]);
        let missing = TemporalSpec::predictor("ldl", 10, Aggregation::Max, 0.0);
        assert!(matches!(
            flatten(&times, &sources, &[missing], no_drops()),
            Err(FlattenError::Configuration(ConfigurationError::UnknownSource(_)))
        ));
        let spec = TemporalSpec::predictor("hba1c", 10, Aggregation::Max, 0.0);
        assert!(matches!(
            flatten(&times, &sources, &[spec.clone(), spec], no_drops()),
            Err(FlattenError::Configuration(ConfigurationError::InvalidSpec { .. }))
        ));
    }

    #[test]
    fn insufficient_look_distance_drops_rows_at_both_ends() {
        let sources = registry(vec![
            EventTable::from_numeric_rows("lab", &[(1, day(0), 1.0), (1, day(100), 1.0)]),
            EventTable::from_numeric_rows("outcome", &[(9, day(0), 1.0), (9, day(100), 1.0)]),
        ]);
        let times = PredictionTimes::from_pairs(&[(1, day(5)), (1, day(10)), (1, day(50)), (1, day(80)), (1, day(81))]);
        let specs = vec![
            TemporalSpec::predictor("lab", 10, Aggregation::Max, 0.0),
            TemporalSpec::outcome("outcome", 20, Aggregation::Max, 0.0, false),
        ];
        let out = flatten(&times, &sources, &specs, FlattenOptions::default()).unwrap();
        assert_eq!(out.prediction_times().timestamps(), &[day(10), day(50), day(80)]);

        let keep_all = flatten(&times, &sources, &specs, no_drops()).unwrap();
        assert_eq!(keep_all.len(), 5);
    }

    #[test]
    fn static_and_age_columns_join_on_entity() {
        let sources = SourceRegistry::new();
        let times = PredictionTimes::from_pairs(&[(1, day(3653)), (2, day(0))]);
        let features = FeatureSet {
            temporal: vec![],
            statics: vec![StaticTable {
                name: "sex".into(),
                entity_ids: vec![1],
                values: ValueColumn::Numeric(vec![1.0]),
                fallback: -1.0,
            }],
            birthdates: Some(BirthdateTable {
                entity_ids: vec![1],
                birthdates: vec![day(0)],
            }),
        };
        let out = Flattener::new(&sources, no_drops()).unwrap().flatten(&times, &features).unwrap();
        assert_eq!(out.column("pred_sex").unwrap().values, FeatureColumn::Numeric(vec![1.0, -1.0]));
        match &out.column("pred_age_in_years").unwrap().values {
            FeatureColumn::Numeric(v) => {
                assert_abs_diff_eq!(v[0], 10.0, epsilon = 1e-9);
                assert!(v[1].is_nan());
            }
            other => panic!("expected numeric ages, got {other:?}"),
        }
    }

    #[test]
    fn static_feature_named_like_age_is_rejected() {
        let sources = SourceRegistry::new();
        let times = PredictionTimes::from_pairs(&[(1, day(3653))]);
        let features = FeatureSet {
            temporal: vec![],
            statics: vec![StaticTable {
                name: AGE_FEATURE_NAME.into(),
                entity_ids: vec![1],
                values: ValueColumn::Numeric(vec![40.0]),
                fallback: f64::NAN,
            }],
            birthdates: Some(BirthdateTable {
                entity_ids: vec![1],
                birthdates: vec![day(0)],
            }),
        };
        let flattener = Flattener::new(&sources, no_drops()).unwrap();
        let err = flattener.flatten(&times, &features).unwrap_err();
        assert!(matches!(
            err,
            FlattenError::Configuration(ConfigurationError::InvalidSpec { column, .. }) if column == "pred_age_in_years"
        ));

        let without_age = FeatureSet { birthdates: None, ..features };
        let out = flattener.flatten(&times, &without_age).unwrap();
        assert_eq!(out.columns().len(), 1);
    }

    #[test]
    fn windows_beyond_the_calendar_range_are_rejected() {
        let sources = registry(vec![EventTable::from_numeric_rows("hba1c", &[(1, day(5), 3.0)])]);
        let times = PredictionTimes::from_pairs(&[(1, day(10))]);
        let specs = vec![TemporalSpec::predictor("hba1c", 200_000_000, Aggregation::Mean, f64::NAN)];
        let err = flatten(&times, &sources, &specs, no_drops()).unwrap_err();
        assert!(matches!(err, FlattenError::Configuration(ConfigurationError::InvalidSpec { .. })));
    }

    #[test]
    fn look_distance_bounds_clamp_instead_of_overflowing() {
        let table = EventTable::from_numeric_rows("lab", &[(1, day(0), 1.0), (1, day(100), 1.0)]);
        let mut indices = AHashMap::new();
        indices.insert("lab".to_string(), EntityIndex::build(&table));
        let times = PredictionTimes::from_pairs(&[(1, day(50))]);
        let mut behind = TemporalSpec::predictor("lab", 10, Aggregation::Max, 0.0);
        behind.interval_days = u32::MAX;
        let mut ahead = TemporalSpec::outcome("lab", 10, Aggregation::Max, 0.0, false);
        ahead.interval_days = u32::MAX;

        let kept = drop_insufficient_look_distance(&times, &[behind, ahead], &indices, &FlattenOptions::default());
        assert!(kept.is_empty());
    }

    #[test]
    fn cache_serves_repeated_runs() {
        let sources = registry(vec![EventTable::from_numeric_rows("hba1c", &[(1, day(5), 3.0)])]);
        let times = PredictionTimes::from_pairs(&[(1, day(10))]);
        let specs = vec![TemporalSpec::predictor("hba1c", 10, Aggregation::Max, 0.0)];
        let cache = FeatureCache::new();
        let flattener = Flattener::new(&sources, no_drops()).unwrap().with_cache(&cache);
        let first = flattener.flatten(&times, &FeatureSet::from_specs(specs.clone())).unwrap();
        let second = flattener.flatten(&times, &FeatureSet::from_specs(specs)).unwrap();
        assert_eq!(first.columns(), second.columns());
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }
}
