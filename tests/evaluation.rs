use approx::assert_abs_diff_eq;
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use ndarray::{Array1, array};
use std::fs;
use tempfile::tempdir;
use timeflat::binning::group_discrete;
use timeflat::evaluate::bucket::{bucket_by_age, bucket_by_days_to_event, bucket_by_weekday, write_performance_tsv};
use timeflat::evaluate::{BootstrapConfig, BucketOptions, EvaluationDataset, Metric, performance_by_bucket};

fn day(offset: i64) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2020, 1, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
        + TimeDelta::days(offset)
}

fn dataset(y: Array1<f64>, p: Array1<f64>) -> EvaluationDataset {
    let n = y.len();
    EvaluationDataset::new((0..n as i64).collect(), (0..n as i64).map(day).collect(), y, p).unwrap()
}

#[test]
fn single_class_bucket_reports_nan_auc() {
    let y = array![1.0, 1.0, 1.0, 0.0, 1.0, 0.0];
    let p = array![0.9, 0.2, 0.4, 0.1, 0.8, 0.3];
    let binned = group_discrete(&[Some("a"), Some("a"), Some("a"), Some("b"), Some("b"), Some("b")]);
    let options = BucketOptions {
        min_n_in_bin: 1,
        bootstrap: None,
    };

    let table = performance_by_bucket(y.view(), p.view(), Metric::RocAuc, &binned, &options).unwrap();

    assert_eq!(table.len(), 2);
    assert_eq!(table[0].bucket, "a");
    assert!(table[0].metric.is_nan());
    assert_eq!(table[0].n_in_bin, 3);
    assert_abs_diff_eq!(table[1].metric, 1.0);
}

#[test]
fn age_buckets_carry_counts_and_prettified_labels() {
    let y = array![0.0, 1.0, 0.0, 1.0, 0.0, 1.0];
    let p = array![0.1, 0.9, 0.2, 0.7, 0.6, 0.4];
    let data = dataset(y.clone(), p.clone())
        .with_age(vec![20.0, 25.0, 30.0, 45.0, 50.0, 55.0])
        .unwrap();
    let binned = bucket_by_age(&data, &[18.0, 40.0, 60.0], true).unwrap();
    let options = BucketOptions {
        min_n_in_bin: 3,
        bootstrap: None,
    };

    let table = performance_by_bucket(y.view(), p.view(), Metric::RocAuc, &binned, &options).unwrap();

    let labels: Vec<&str> = table.iter().map(|row| row.bucket.as_str()).collect();
    assert_eq!(labels, vec!["18-39", "40-59", "60+"]);
    assert_eq!(table.iter().map(|r| r.n_in_bin).collect::<Vec<_>>(), vec![3, 3, 0]);
    assert_abs_diff_eq!(table[0].metric, 1.0);
    assert_abs_diff_eq!(table[1].metric, 0.5);
    assert!(table[2].metric.is_nan());
}

#[test]
fn days_to_event_leaves_rows_without_outcome_unassigned() {
    let data = dataset(array![1.0, 0.0, 1.0], array![0.8, 0.3, 0.6])
        .with_outcome_timestamps(vec![Some(day(10)), None, Some(day(400))])
        .unwrap();
    let binned = bucket_by_days_to_event(&data, &[0.0, 30.0, 365.0], false).unwrap();
    assert_eq!(binned.row_labels(), vec![Some("[0, 30)"), None, Some("[365, +inf)")]);
}

#[test]
fn weekday_buckets_keep_calendar_order() {
    let data = dataset(array![0.0, 1.0], array![0.5, 0.5]);
    let binned = bucket_by_weekday(&data);
    let labels = binned.labels();
    assert_eq!(labels.len(), 7);
    assert_eq!(labels[0], "Monday");
    // 2020-01-01 was a Wednesday.
    assert_eq!(binned.row_labels(), vec![Some("Wednesday"), Some("Thursday")]);
}

#[test]
fn bootstrap_interval_brackets_the_point_estimate() {
    let n = 200;
    let y: Array1<f64> = (0..n).map(|i| if i % 2 == 0 { 1.0 } else { 0.0 }).collect();
    let p: Array1<f64> = (0..n)
        .map(|i| if i % 2 == 0 { 0.6 + (i % 7) as f64 * 0.05 } else { 0.2 + (i % 11) as f64 * 0.05 })
        .collect();
    let labels: Vec<Option<&str>> = vec![Some("all"); n];
    let binned = group_discrete(&labels);
    let options = BucketOptions {
        min_n_in_bin: 5,
        bootstrap: Some(BootstrapConfig {
            confidence_interval: 0.95,
            resamples: 200,
            seed: 7,
        }),
    };

    let table = performance_by_bucket(y.view(), p.view(), Metric::RocAuc, &binned, &options).unwrap();

    let row = &table[0];
    let (low, high) = (row.ci_low.unwrap(), row.ci_high.unwrap());
    assert!(low <= row.metric && row.metric <= high, "{low} <= {} <= {high}", row.metric);
}

#[test]
fn performance_table_is_written_as_tsv() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("performance_by_sex.tsv");
    let y = array![1.0, 0.0, 1.0, 0.0];
    let p = array![0.7, 0.2, 0.4, 0.6];
    let binned = group_discrete(&[Some("F"), Some("F"), Some("M"), Some("M")]);
    let options = BucketOptions {
        min_n_in_bin: 2,
        bootstrap: None,
    };
    let table = performance_by_bucket(y.view(), p.view(), Metric::Brier, &binned, &options).unwrap();

    write_performance_tsv(&table, &path).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    let mut lines = text.lines();
    assert_eq!(lines.next(), Some("bucket\tmetric\tn_in_bin\tci_low\tci_high"));
    assert!(lines.next().unwrap().starts_with("F\t"));
    assert!(lines.next().unwrap().starts_with("M\t"));
}
