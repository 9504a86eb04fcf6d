// ========================================================================================
//
//                      RAW TABLE LOADING AND COLUMNAR PERSISTENCE
//
// ========================================================================================
//
// Every raw source is read into a DataFrame, checked for the columns it must carry,
// and normalised into the typed tables the engine consumes. Column names are
// configurable per table; once loaded, nothing downstream refers to them again.

use crate::errors::FlattenError;
use crate::types::{
    BirthdateTable, EntityId, EventTable, PredictionTimes, StaticTable, Timestamp, ValueColumn,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use polars::prelude::*;
use std::fs::File;
use std::path::Path;

const TIMESTAMP_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Reads a parquet, CSV or TSV file. The format is chosen by extension; anything
/// that is neither parquet nor `.csv` is read as tab-separated.
pub fn read_table(path: &Path) -> Result<DataFrame, FlattenError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    let file = File::open(path)?;
    let df = match extension.as_deref() {
        Some("parquet") | Some("pq") => ParquetReader::new(file).finish()?,
        other => {
            let separator = if other == Some("csv") { b',' } else { b'\t' };
            CsvReadOptions::default()
                .with_has_header(true)
                .map_parse_options(|options| options.with_separator(separator))
                .into_reader_with_file_handle(file)
                .finish()?
        }
    };
    log::debug!("Read {} rows from '{}'", df.height(), path.display());
    Ok(df)
}

/// Fails with every missing column listed, not just the first.
pub fn require_columns(df: &DataFrame, table: &str, required: &[&str]) -> Result<(), FlattenError> {
    let present: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
    let missing: Vec<String> = required
        .iter()
        .filter(|name| !present.iter().any(|p| p == *name))
        .map(|name| name.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(FlattenError::Schema {
            table: table.to_string(),
            missing,
        })
    }
}

pub fn extract_entity_ids(df: &DataFrame, table: &str, column: &str) -> Result<Vec<EntityId>, FlattenError> {
    let source = df.column(column)?;
    let casted = source
        .cast(&DataType::Int64)
        .map_err(|_| wrong_type(table, column, "an integer entity id", source.dtype()))?;
    let ids = casted.as_materialized_series().i64()?;
    if ids.null_count() > 0 {
        return Err(FlattenError::NullValues {
            table: table.to_string(),
            column: column.to_string(),
            count: ids.null_count(),
        });
    }
    Ok(ids.into_no_null_iter().collect())
}

/// Accepts native date/datetime columns and strings in ISO-like layouts.
pub fn extract_timestamps(df: &DataFrame, table: &str, column: &str) -> Result<Vec<Timestamp>, FlattenError> {
    let parsed = extract_optional_timestamps(df, table, column)?;
    let nulls = parsed.iter().filter(|t| t.is_none()).count();
    if nulls > 0 {
        return Err(FlattenError::NullValues {
            table: table.to_string(),
            column: column.to_string(),
            count: nulls,
        });
    }
    Ok(parsed.into_iter().flatten().collect())
}

/// Like [`extract_timestamps`], but nulls survive as `None`.
pub fn extract_optional_timestamps(
    df: &DataFrame,
    table: &str,
    column: &str,
) -> Result<Vec<Option<Timestamp>>, FlattenError> {
    let source = df.column(column)?;
    match source.dtype() {
        DataType::Datetime(_, _) | DataType::Date => {
            let millis = source
                .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))?
                .cast(&DataType::Int64)?;
            millis
                .as_materialized_series()
                .i64()?
                .into_iter()
                .map(|value| match value {
                    None => Ok(None),
                    Some(ms) => DateTime::from_timestamp_millis(ms)
                        .map(|dt| Some(dt.naive_utc()))
                        .ok_or_else(|| FlattenError::UnparseableTimestamp {
                            table: table.to_string(),
                            column: column.to_string(),
                            value: ms.to_string(),
                        }),
                })
                .collect()
        }
        DataType::String => source
            .as_materialized_series()
            .str()?
            .into_iter()
            .map(|value| match value {
                None => Ok(None),
                Some(text) => parse_timestamp(text).map(Some).ok_or_else(|| {
                    FlattenError::UnparseableTimestamp {
                        table: table.to_string(),
                        column: column.to_string(),
                        value: text.to_string(),
                    }
                }),
            })
            .collect(),
        other => Err(wrong_type(table, column, "a timestamp", other)),
    }
}

pub fn parse_timestamp(text: &str) -> Option<Timestamp> {
    let text = text.trim();
    TIMESTAMP_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(text, "%Y-%m-%d")
                .ok()
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Numeric nulls become NaN, which every numeric aggregation skips. Text values
/// must be present.
pub fn extract_values(df: &DataFrame, table: &str, column: &str) -> Result<ValueColumn, FlattenError> {
    let source = df.column(column)?;
    match source.dtype() {
        DataType::String => {
            let text = source.as_materialized_series().str()?;
            if text.null_count() > 0 {
                return Err(FlattenError::NullValues {
                    table: table.to_string(),
                    column: column.to_string(),
                    count: text.null_count(),
                });
            }
            Ok(ValueColumn::Text(
                text.into_no_null_iter().map(str::to_string).collect(),
            ))
        }
        DataType::Datetime(_, _) | DataType::Date => {
            Err(wrong_type(table, column, "a numeric or text value", source.dtype()))
        }
        dtype => {
            let casted = source
                .cast(&DataType::Float64)
                .map_err(|_| wrong_type(table, column, "a numeric or text value", dtype))?;
            Ok(ValueColumn::Numeric(
                casted
                    .as_materialized_series()
                    .f64()?
                    .into_iter()
                    .map(|v| v.unwrap_or(f64::NAN))
                    .collect(),
            ))
        }
    }
}

fn wrong_type(table: &str, column: &str, expected: &'static str, found: &DataType) -> FlattenError {
    FlattenError::ColumnWrongType {
        table: table.to_string(),
        column: column.to_string(),
        expected,
        found: found.to_string(),
    }
}

pub fn load_event_table(
    path: &Path,
    name: &str,
    entity_id_col: &str,
    timestamp_col: &str,
    value_col: &str,
) -> Result<EventTable, FlattenError> {
    let df = read_table(path)?;
    require_columns(&df, name, &[entity_id_col, timestamp_col, value_col])?;
    let table = EventTable::new(
        name,
        extract_entity_ids(&df, name, entity_id_col)?,
        extract_timestamps(&df, name, timestamp_col)?,
        extract_values(&df, name, value_col)?,
    )?;
    log::info!("Loaded source '{}' with {} events", name, table.len());
    Ok(table)
}

/// Loads an event table whose value column is irrelevant (quarantine triggers).
pub fn load_trigger_table(
    path: &Path,
    name: &str,
    entity_id_col: &str,
    timestamp_col: &str,
) -> Result<EventTable, FlattenError> {
    let df = read_table(path)?;
    require_columns(&df, name, &[entity_id_col, timestamp_col])?;
    let entity_ids = extract_entity_ids(&df, name, entity_id_col)?;
    let timestamps = extract_timestamps(&df, name, timestamp_col)?;
    let ones = ValueColumn::Numeric(vec![1.0; entity_ids.len()]);
    EventTable::new(name, entity_ids, timestamps, ones)
}

pub fn load_prediction_times(
    path: &Path,
    entity_id_col: &str,
    timestamp_col: &str,
) -> Result<PredictionTimes, FlattenError> {
    const TABLE: &str = "prediction_times";
    let df = read_table(path)?;
    require_columns(&df, TABLE, &[entity_id_col, timestamp_col])?;
    let times = PredictionTimes::new(
        extract_entity_ids(&df, TABLE, entity_id_col)?,
        extract_timestamps(&df, TABLE, timestamp_col)?,
    )?;
    log::info!("Loaded {} candidate prediction times", times.len());
    Ok(times)
}

pub fn load_static_table(
    path: &Path,
    name: &str,
    entity_id_col: &str,
    value_col: &str,
    fallback: f64,
) -> Result<StaticTable, FlattenError> {
    let df = read_table(path)?;
    require_columns(&df, name, &[entity_id_col, value_col])?;
    Ok(StaticTable {
        name: name.to_string(),
        entity_ids: extract_entity_ids(&df, name, entity_id_col)?,
        values: extract_values(&df, name, value_col)?,
        fallback,
    })
}

pub fn load_birthdates(path: &Path, entity_id_col: &str, birthdate_col: &str) -> Result<BirthdateTable, FlattenError> {
    const TABLE: &str = "birthdates";
    let df = read_table(path)?;
    require_columns(&df, TABLE, &[entity_id_col, birthdate_col])?;
    Ok(BirthdateTable {
        entity_ids: extract_entity_ids(&df, TABLE, entity_id_col)?,
        birthdates: extract_timestamps(&df, TABLE, birthdate_col)?,
    })
}

pub fn write_parquet(df: &mut DataFrame, path: &Path) -> Result<(), FlattenError> {
    let mut file = File::create(path)?;
    ParquetWriter::new(&mut file).finish(df)?;
    log::debug!("Wrote {} rows to '{}'", df.height(), path.display());
    Ok(())
}
