//! # The Flattened Dataset
//!
//! One row per surviving prediction time, the identity columns, and one column per
//! resolved specification. Column metadata travels with the values so consumers
//! never have to re-derive it from names.

use crate::columns::ColumnMetadata;
use crate::types::{FeatureColumn, PredictionTimes};
use polars::prelude::*;

pub const ENTITY_ID_COL: &str = "entity_id";
pub const TIMESTAMP_COL: &str = "timestamp";
pub const PRED_TIME_UUID_COL: &str = "pred_time_uuid";

#[derive(Debug, Clone, PartialEq)]
pub struct FlattenedColumn {
    pub metadata: ColumnMetadata,
    pub values: FeatureColumn,
    pub fallback_proportion: f64,
}

#[derive(Debug, Clone)]
pub struct FlattenedDataset {
    prediction_times: PredictionTimes,
    columns: Vec<FlattenedColumn>,
}

impl FlattenedDataset {
    pub(crate) fn new(prediction_times: PredictionTimes, columns: Vec<FlattenedColumn>) -> Self {
        Self {
            prediction_times,
            columns,
        }
    }

    pub fn len(&self) -> usize {
        self.prediction_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prediction_times.is_empty()
    }

    pub fn prediction_times(&self) -> &PredictionTimes {
        &self.prediction_times
    }

    pub fn columns(&self) -> &[FlattenedColumn] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&FlattenedColumn> {
        self.columns.iter().find(|c| c.metadata.name == name)
    }

    pub fn metadata(&self) -> Vec<ColumnMetadata> {
        self.columns.iter().map(|c| c.metadata.clone()).collect()
    }

    /// A new dataset restricted to `rows`, in the given order.
    pub fn select_rows(&self, rows: &[usize]) -> Self {
        Self {
            prediction_times: self.prediction_times.select(rows),
            columns: self
                .columns
                .iter()
                .map(|c| FlattenedColumn {
                    metadata: c.metadata.clone(),
                    values: c.values.select(rows),
                    fallback_proportion: c.fallback_proportion,
                })
                .collect(),
        }
    }

    pub fn to_dataframe(&self) -> PolarsResult<DataFrame> {
        let millis: Vec<i64> = self
            .prediction_times
            .timestamps()
            .iter()
            .map(|t| t.and_utc().timestamp_millis())
            .collect();
        let timestamps = Int64Chunked::from_vec(TIMESTAMP_COL.into(), millis)
            .into_datetime(TimeUnit::Milliseconds, None)
            .into_series();

        let mut columns: Vec<Column> = Vec::with_capacity(self.columns.len() + 3);
        columns.push(Column::new(
            ENTITY_ID_COL.into(),
            self.prediction_times.entity_ids().to_vec(),
        ));
        columns.push(Column::from(timestamps));
        columns.push(Column::new(
            PRED_TIME_UUID_COL.into(),
            self.prediction_times.uuids().to_vec(),
        ));
        for column in &self.columns {
            let name = PlSmallStr::from(column.metadata.name.as_str());
            columns.push(match &column.values {
                FeatureColumn::Numeric(v) => Column::new(name, v.clone()),
                FeatureColumn::Text(v) => Column::new(name, v.clone()),
            });
        }
        DataFrame::new(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ColumnPrefix;
    use crate::types::test_support::day;

    fn dataset() -> FlattenedDataset {
        let times = PredictionTimes::from_pairs(&[(1, day(0)), (2, day(1)), (3, day(2))]);
        FlattenedDataset::new(
            times,
            vec![
                FlattenedColumn {
                    metadata: ColumnMetadata::static_column(ColumnPrefix::Pred, "sex"),
                    values: FeatureColumn::Numeric(vec![0.0, 1.0, f64::NAN]),
                    fallback_proportion: 1.0 / 3.0,
                },
                FlattenedColumn {
                    metadata: ColumnMetadata::static_column(ColumnPrefix::Eval, "note"),
                    values: FeatureColumn::Text(vec![Some("a".into()), None, Some("c".into())]),
                    fallback_proportion: 1.0 / 3.0,
                },
            ],
        )
    }

    #[test]
    fn dataframe_carries_identity_and_feature_columns() {
        let df = dataset().to_dataframe().unwrap();
        assert_eq!(df.height(), 3);
        let names: Vec<String> = df.get_column_names().iter().map(|c| c.to_string()).collect();
        assert_eq!(
            names,
            vec!["entity_id", "timestamp", "pred_time_uuid", "pred_sex", "eval_note"]
        );
        assert!(matches!(
            df.column(TIMESTAMP_COL).unwrap().dtype(),
            DataType::Datetime(TimeUnit::Milliseconds, _)
        ));
        assert_eq!(df.column("eval_note").unwrap().null_count(), 1);
    }

    #[test]
    fn row_selection_keeps_columns_aligned() {
        let subset = dataset().select_rows(&[2, 0]);
        assert_eq!(subset.prediction_times().entity_ids(), &[3, 1]);
        assert_eq!(
            subset.column("eval_note").unwrap().values,
            FeatureColumn::Text(vec![Some("c".into()), Some("a".into())])
        );
    }
}
