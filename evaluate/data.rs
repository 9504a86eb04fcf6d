//! The evaluation dataset: predictions joined back onto prediction times.

use crate::errors::FlattenError;
use crate::evaluate::EvaluationError;
use crate::io::{
    extract_entity_ids, extract_optional_timestamps, extract_timestamps, extract_values, read_table,
    require_columns,
};
use crate::types::{EntityId, Timestamp, ValueColumn};
use ndarray::Array1;
use polars::prelude::DataFrame;
use std::path::Path;

const TABLE: &str = "evaluation";

/// Column names of an evaluation file. Optional columns are only read when named.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationColumns {
    pub entity_id: String,
    pub pred_timestamp: String,
    pub outcome_timestamp: Option<String>,
    pub y: String,
    pub y_hat_probs: String,
    pub age: Option<String>,
    pub sex: Option<String>,
}

impl Default for EvaluationColumns {
    fn default() -> Self {
        Self {
            entity_id: "entity_id".to_string(),
            pred_timestamp: "pred_timestamp".to_string(),
            outcome_timestamp: None,
            y: "y".to_string(),
            y_hat_probs: "y_hat_probs".to_string(),
            age: None,
            sex: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationDataset {
    pub entity_ids: Vec<EntityId>,
    pub pred_timestamps: Vec<Timestamp>,
    /// `None` where the entity never had the outcome.
    pub outcome_timestamps: Option<Vec<Option<Timestamp>>>,
    pub y: Array1<f64>,
    pub y_hat_probs: Array1<f64>,
    pub age: Option<Vec<f64>>,
    pub sex: Option<Vec<Option<String>>>,
}

impl EvaluationDataset {
    /// Builds a dataset with only the required columns.
    pub fn new(
        entity_ids: Vec<EntityId>,
        pred_timestamps: Vec<Timestamp>,
        y: Array1<f64>,
        y_hat_probs: Array1<f64>,
    ) -> Result<Self, EvaluationError> {
        let dataset = Self {
            entity_ids,
            pred_timestamps,
            outcome_timestamps: None,
            y,
            y_hat_probs,
            age: None,
            sex: None,
        };
        dataset.validate()?;
        Ok(dataset)
    }

    pub fn with_outcome_timestamps(mut self, timestamps: Vec<Option<Timestamp>>) -> Result<Self, EvaluationError> {
        check_len(self.len(), timestamps.len())?;
        self.outcome_timestamps = Some(timestamps);
        Ok(self)
    }

    pub fn with_age(mut self, age: Vec<f64>) -> Result<Self, EvaluationError> {
        check_len(self.len(), age.len())?;
        self.age = Some(age);
        Ok(self)
    }

    pub fn with_sex(mut self, sex: Vec<Option<String>>) -> Result<Self, EvaluationError> {
        check_len(self.len(), sex.len())?;
        self.sex = Some(sex);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entity_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }

    fn validate(&self) -> Result<(), EvaluationError> {
        if self.is_empty() {
            return Err(EvaluationError::Empty);
        }
        check_len(self.len(), self.pred_timestamps.len())?;
        check_len(self.len(), self.y.len())?;
        check_len(self.len(), self.y_hat_probs.len())
    }

    pub fn load(path: &Path, columns: &EvaluationColumns) -> Result<Self, EvaluationError> {
        let df = read_table(path)?;
        let mut required = vec![
            columns.entity_id.as_str(),
            columns.pred_timestamp.as_str(),
            columns.y.as_str(),
            columns.y_hat_probs.as_str(),
        ];
        required.extend(
            [&columns.outcome_timestamp, &columns.age, &columns.sex]
                .into_iter()
                .flatten()
                .map(String::as_str),
        );
        require_columns(&df, TABLE, &required)?;

        let mut dataset = Self::new(
            extract_entity_ids(&df, TABLE, &columns.entity_id)?,
            extract_timestamps(&df, TABLE, &columns.pred_timestamp)?,
            numeric(&df, &columns.y)?,
            numeric(&df, &columns.y_hat_probs)?,
        )?;
        if let Some(name) = &columns.outcome_timestamp {
            dataset = dataset.with_outcome_timestamps(extract_optional_timestamps(&df, TABLE, name)?)?;
        }
        if let Some(name) = &columns.age {
            dataset = dataset.with_age(numeric(&df, name)?.to_vec())?;
        }
        if let Some(name) = &columns.sex {
            dataset = dataset.with_sex(categorical(&df, name)?)?;
        }
        log::info!("Loaded {} evaluation rows from '{}'", dataset.len(), path.display());
        Ok(dataset)
    }
}

fn check_len(expected: usize, found: usize) -> Result<(), EvaluationError> {
    if expected == found {
        Ok(())
    } else {
        Err(EvaluationError::LengthMismatch { expected, found })
    }
}

fn numeric(df: &DataFrame, column: &str) -> Result<Array1<f64>, EvaluationError> {
    match extract_values(df, TABLE, column)? {
        ValueColumn::Numeric(v) => Ok(Array1::from_vec(v)),
        ValueColumn::Text(_) => Err(EvaluationError::Load(FlattenError::ColumnWrongType {
            table: TABLE.to_string(),
            column: column.to_string(),
            expected: "a numeric value",
            found: "str".to_string(),
        })),
    }
}

/// Text columns stay as they are; numeric codes become their integer rendering.
fn categorical(df: &DataFrame, column: &str) -> Result<Vec<Option<String>>, EvaluationError> {
    Ok(match extract_values(df, TABLE, column)? {
        ValueColumn::Text(v) => v.into_iter().map(Some).collect(),
        ValueColumn::Numeric(v) => v
            .into_iter()
            .map(|x| {
                if x.is_nan() {
                    None
                } else if x.fract() == 0.0 {
                    Some(format!("{}", x as i64))
                } else {
                    Some(x.to_string())
                }
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::day;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn loads_optional_columns_when_named() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eval.csv");
        fs::write(
            &path,
            "entity_id,pred_timestamp,outcome_timestamp,y,y_hat_probs,age,sex\n\
             1,2020-01-01,2020-01-11,1,0.9,45.5,1\n\
             2,2020-01-02,,0,0.2,61.0,0\n",
        )
        .unwrap();
        let columns = EvaluationColumns {
            outcome_timestamp: Some("outcome_timestamp".into()),
            age: Some("age".into()),
            sex: Some("sex".into()),
            ..EvaluationColumns::default()
        };
        let dataset = EvaluationDataset::load(&path, &columns).unwrap();
        assert_eq!(dataset.len(), 2);
        assert_eq!(dataset.pred_timestamps[1], day(1));
        assert_eq!(
            dataset.outcome_timestamps,
            Some(vec![Some(day(10)), None])
        );
        assert_eq!(dataset.age, Some(vec![45.5, 61.0]));
        assert_eq!(dataset.sex, Some(vec![Some("1".to_string()), Some("0".to_string())]));
    }

    #[test]
    fn missing_columns_are_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("eval.csv");
        fs::write(&path, "entity_id,pred_timestamp,y\n1,2020-01-01,1\n").unwrap();
        let err = EvaluationDataset::load(&path, &EvaluationColumns::default()).unwrap_err();
        assert!(matches!(
            err,
            EvaluationError::Load(FlattenError::Schema { ref missing, .. })
                if missing == &vec!["y_hat_probs".to_string()]
        ));
    }

    #[test]
    fn mismatched_lengths_are_rejected() {
        let err = EvaluationDataset::new(vec![1, 2], vec![day(0), day(1)], Array1::zeros(2), Array1::zeros(3))
            .unwrap_err();
        assert!(matches!(err, EvaluationError::LengthMismatch { expected: 2, found: 3 }));
    }
}
