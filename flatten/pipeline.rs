// ========================================================================================
//
//                              THE END-TO-END FLATTENING RUN
//
// ========================================================================================
//
// Loading is a sequential prior step: every table is read into memory before any
// aggregation starts, so no I/O happens inside the parallel section. Nothing is
// written to disk unless the whole flattening step succeeded.

use crate::config::RunConfig;
use crate::describe::IntegrityReport;
use crate::engine::{FeatureSet, Flattener};
use crate::errors::FlattenError;
use crate::filter::filter_prediction_times;
use crate::io;
use crate::progress::FlattenProgressObserver;
use crate::split::write_splits;
use crate::types::{EventTable, PredictionTimes, SourceRegistry};

const QUARANTINE_TABLE: &str = "quarantine";

/// Loads every input of `config`, filters, flattens, splits and writes the result.
pub fn run(config: &RunConfig, progress: &dyn FlattenProgressObserver) -> Result<IntegrityReport, FlattenError> {
    let prediction_times = load_filtered_prediction_times(config)?;

    let mut sources = SourceRegistry::new();
    for source in &config.sources {
        sources.insert(io::load_event_table(
            &config.resolve(&source.path),
            &source.name,
            &source.entity_id_col,
            &source.timestamp_col,
            &source.value_col,
        )?);
    }

    let statics = config
        .static_features
        .iter()
        .map(|feature| {
            io::load_static_table(
                &config.resolve(&feature.path),
                &feature.name,
                &feature.entity_id_col,
                &feature.value_col,
                feature.fallback,
            )
        })
        .collect::<Result<Vec<_>, _>>()?;

    let birthdates = config
        .age
        .as_ref()
        .map(|age| io::load_birthdates(&config.resolve(&age.path), &age.entity_id_col, &age.birthdate_col))
        .transpose()?;

    let features = FeatureSet {
        temporal: config.temporal_specs(),
        statics,
        birthdates,
    };
    let dataset = Flattener::new(&sources, config.flatten_options())?
        .with_progress(progress)
        .flatten(&prediction_times, &features)?;

    let output_dir = config.resolve(&config.output.dir);
    let report = write_splits(&dataset, &config.split, &output_dir)?;
    log::info!(
        "Finished: {} rows, {} columns written to '{}'",
        report.n_rows,
        dataset.columns().len(),
        output_dir.display()
    );
    Ok(report)
}

fn load_filtered_prediction_times(config: &RunConfig) -> Result<PredictionTimes, FlattenError> {
    let times_config = &config.prediction_times;
    let prediction_times = io::load_prediction_times(
        &config.resolve(&times_config.path),
        &times_config.entity_id_col,
        &times_config.timestamp_col,
    )?;

    let Some(quarantine) = &config.quarantine else {
        return Ok(prediction_times);
    };
    let events: Option<EventTable> = quarantine
        .path
        .as_ref()
        .map(|path| {
            io::load_trigger_table(
                &config.resolve(path),
                QUARANTINE_TABLE,
                &quarantine.entity_id_col,
                &quarantine.timestamp_col,
            )
        })
        .transpose()?;
    filter_prediction_times(&prediction_times, events.as_ref(), quarantine.interval_days)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoopFlattenProgress;
    use crate::split::{COLUMN_METADATA_FILE, Split};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn a_configured_run_writes_every_split() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("visits.csv"),
            "entity_id,timestamp\n1,2020-03-01\n1,2020-06-01\n2,2020-03-01\n3,2020-03-01\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("admissions.csv"),
            "entity_id,timestamp\n1,2020-05-01\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("hba1c.csv"),
            "entity_id,timestamp,value\n1,2020-01-01,40\n1,2020-02-20,48\n2,2020-01-15,38\n",
        )
        .unwrap();
        fs::write(dir.path().join("sex.csv"), "entity_id,value\n1,1\n2,0\n").unwrap();
        fs::write(
            dir.path().join("run.toml"),
            r#"
            drop_insufficient_lookbehind = false
            drop_insufficient_lookahead = false
            n_workers = 2

            [prediction_times]
            path = "visits.csv"

            [quarantine]
            path = "admissions.csv"
            interval_days = 60

            [[sources]]
            name = "hba1c"
            path = "hba1c.csv"

            [[predictors]]
            sources = ["hba1c"]
            interval_days = [30]
            aggregations = ["max", "count"]

            [[static_features]]
            name = "sex"
            path = "sex.csv"

            [split]
            train = 1.0
            val = 0.0
            test = 0.0

            [output]
            dir = "flattened"
            "#,
        )
        .unwrap();

        let config = RunConfig::load(&dir.path().join("run.toml")).unwrap();
        let report = run(&config, &NoopFlattenProgress).unwrap();

        // 2020-06-01 falls 31 days after the admission and is quarantined.
        assert_eq!(report.n_rows, 3);
        assert_eq!(report.n_predictor_columns, 3);
        assert_eq!(report.splits[0].split, Split::Train);
        assert_eq!(report.splits[0].n_rows, 3);
        assert!(dir.path().join("flattened").join(COLUMN_METADATA_FILE).exists());

        let train = io::read_table(&dir.path().join("flattened").join("train.parquet")).unwrap();
        let max = train
            .column("pred_hba1c_within_30_days_max_fallback_nan")
            .unwrap()
            .as_materialized_series()
            .f64()
            .unwrap()
            .into_iter()
            .collect::<Vec<_>>();
        assert_eq!(max[0], Some(48.0));
        assert!(max[1].unwrap().is_nan());
        assert!(max[2].unwrap().is_nan());
    }
}
