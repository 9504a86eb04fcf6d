// ========================================================================================
//
//                              PERFORMANCE BY BUCKET
//
// ========================================================================================
//
// Each bucket is an independent unit: its metric and bootstrap interval depend only
// on its own rows and its own RNG stream, seeded from the configured seed and the
// bucket's index. Buckets are therefore mapped in parallel and the result is
// identical for any number of workers.

use crate::binning::{Binned, Bucket, bin_continuous, group_discrete};
use crate::evaluate::EvaluationError;
use crate::evaluate::data::EvaluationDataset;
use crate::evaluate::metrics::Metric;
use crate::parallel::par_map;
use chrono::Datelike;
use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

pub const DEFAULT_MIN_N_IN_BIN: usize = 5;
pub const DEFAULT_RESAMPLES: usize = 1000;

const WEEKDAYS: [&str; 7] = [
    "Monday",
    "Tuesday",
    "Wednesday",
    "Thursday",
    "Friday",
    "Saturday",
    "Sunday",
];
const MONTHS: [&str; 12] = [
    "January",
    "February",
    "March",
    "April",
    "May",
    "June",
    "July",
    "August",
    "September",
    "October",
    "November",
    "December",
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BootstrapConfig {
    pub confidence_interval: f64,
    pub resamples: usize,
    pub seed: u64,
}

impl BootstrapConfig {
    pub fn new(confidence_interval: f64) -> Self {
        Self {
            confidence_interval,
            resamples: DEFAULT_RESAMPLES,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketOptions {
    /// Buckets with fewer rows report a NaN metric.
    pub min_n_in_bin: usize,
    pub bootstrap: Option<BootstrapConfig>,
}

impl Default for BucketOptions {
    fn default() -> Self {
        Self {
            min_n_in_bin: DEFAULT_MIN_N_IN_BIN,
            bootstrap: None,
        }
    }
}

/// One row of the performance table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketPerformance {
    pub bucket: String,
    pub metric: f64,
    pub n_in_bin: usize,
    pub ci_low: Option<f64>,
    pub ci_high: Option<f64>,
}

/// Computes `metric` for every bucket of `binned`.
///
/// Buckets below `min_n_in_bin` rows and buckets where the metric is undefined
/// report NaN. Undefined buckets are logged once, in aggregate.
pub fn performance_by_bucket(
    y: ArrayView1<f64>,
    p: ArrayView1<f64>,
    metric: Metric,
    binned: &Binned,
    options: &BucketOptions,
) -> Result<Vec<BucketPerformance>, EvaluationError> {
    if y.len() != p.len() {
        return Err(EvaluationError::LengthMismatch {
            expected: y.len(),
            found: p.len(),
        });
    }
    if y.len() != binned.assignments.len() {
        return Err(EvaluationError::LengthMismatch {
            expected: y.len(),
            found: binned.assignments.len(),
        });
    }
    if let Some(bootstrap) = &options.bootstrap {
        let level = bootstrap.confidence_interval;
        if !(level > 0.0 && level < 1.0) {
            return Err(EvaluationError::InvalidConfidence(level));
        }
    }

    let rows = binned.rows_per_bucket();
    let units: Vec<(usize, &Bucket, &Vec<usize>)> = binned
        .buckets
        .iter()
        .zip(&rows)
        .enumerate()
        .map(|(i, (bucket, r))| (i, bucket, r))
        .collect();
    let degenerate = AtomicUsize::new(0);

    let table = par_map(&units, |&(index, bucket, bucket_rows)| -> Result<_, EvaluationError> {
        let n_in_bin = bucket_rows.len();
        if n_in_bin < options.min_n_in_bin {
            return Ok(BucketPerformance {
                bucket: bucket.label.clone(),
                metric: f64::NAN,
                n_in_bin,
                ci_low: None,
                ci_high: None,
            });
        }
        let y_bucket: Array1<f64> = bucket_rows.iter().map(|&r| y[r]).collect();
        let p_bucket: Array1<f64> = bucket_rows.iter().map(|&r| p[r]).collect();
        let value = if metric.is_defined_for(y_bucket.view()) {
            metric.compute(y_bucket.view(), p_bucket.view())
        } else {
            f64::NAN
        };
        if value.is_nan() {
            degenerate.fetch_add(1, Ordering::Relaxed);
        }
        let (ci_low, ci_high) = match &options.bootstrap {
            Some(bootstrap) if !value.is_nan() => {
                let (low, high) = bootstrap_interval(y_bucket.view(), p_bucket.view(), metric, bootstrap, index);
                (Some(low), Some(high))
            }
            _ => (None, None),
        };
        Ok(BucketPerformance {
            bucket: bucket.label.clone(),
            metric: value,
            n_in_bin,
            ci_low,
            ci_high,
        })
    })?;

    let undefined = degenerate.into_inner();
    if undefined > 0 {
        log::warn!(
            "{} of {} buckets have an undefined {} (e.g. a single outcome class); reported as NaN",
            undefined,
            table.len(),
            metric
        );
    }
    Ok(table)
}

/// Percentile bootstrap over rows resampled with replacement. Resamples on which
/// the metric is undefined are skipped.
fn bootstrap_interval(
    y: ArrayView1<f64>,
    p: ArrayView1<f64>,
    metric: Metric,
    config: &BootstrapConfig,
    bucket_index: usize,
) -> (f64, f64) {
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(bucket_index as u64));
    let n = y.len();
    let mut y_sample = Array1::<f64>::zeros(n);
    let mut p_sample = Array1::<f64>::zeros(n);
    let mut estimates = Vec::with_capacity(config.resamples);
    for _ in 0..config.resamples {
        for k in 0..n {
            let r = rng.gen_range(0..n);
            y_sample[k] = y[r];
            p_sample[k] = p[r];
        }
        if !metric.is_defined_for(y_sample.view()) {
            continue;
        }
        let estimate = metric.compute(y_sample.view(), p_sample.view());
        if !estimate.is_nan() {
            estimates.push(estimate);
        }
    }
    if estimates.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    estimates.sort_by(f64::total_cmp);
    let alpha = (1.0 - config.confidence_interval) / 2.0;
    (percentile(&estimates, alpha), percentile(&estimates, 1.0 - alpha))
}

/// Linear interpolation between closest ranks of a sorted sample.
fn percentile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let weight = position - lower as f64;
    sorted[lower] * (1.0 - weight) + sorted[upper] * weight
}

pub fn bucket_by_age(dataset: &EvaluationDataset, edges: &[f64], prettify: bool) -> Result<Binned, EvaluationError> {
    let age = dataset.age.as_ref().ok_or(EvaluationError::MissingColumn("age"))?;
    Ok(bin_continuous(age, edges, prettify)?)
}

/// Days from prediction to outcome; rows without an outcome are left unassigned.
pub fn bucket_by_days_to_event(
    dataset: &EvaluationDataset,
    edges: &[f64],
    prettify: bool,
) -> Result<Binned, EvaluationError> {
    let outcomes = dataset
        .outcome_timestamps
        .as_ref()
        .ok_or(EvaluationError::MissingColumn("days to event"))?;
    let days: Vec<f64> = dataset
        .pred_timestamps
        .iter()
        .zip(outcomes)
        .map(|(pred, outcome)| match outcome {
            Some(t) => (*t - *pred).num_seconds() as f64 / 86_400.0,
            None => f64::NAN,
        })
        .collect();
    Ok(bin_continuous(&days, edges, prettify)?)
}

pub fn bucket_by_sex(dataset: &EvaluationDataset) -> Result<Binned, EvaluationError> {
    let sex = dataset.sex.as_ref().ok_or(EvaluationError::MissingColumn("sex"))?;
    Ok(group_discrete(sex))
}

pub fn bucket_by_weekday(dataset: &EvaluationDataset) -> Binned {
    let positions: Vec<usize> = dataset
        .pred_timestamps
        .iter()
        .map(|t| t.weekday().num_days_from_monday() as usize)
        .collect();
    group_ordered(&positions, &WEEKDAYS)
}

pub fn bucket_by_month(dataset: &EvaluationDataset) -> Binned {
    let positions: Vec<usize> = dataset.pred_timestamps.iter().map(|t| t.month0() as usize).collect();
    group_ordered(&positions, &MONTHS)
}

/// Groups in calendar order; every group is listed even when empty.
fn group_ordered(positions: &[usize], labels: &[&str]) -> Binned {
    Binned {
        buckets: labels
            .iter()
            .map(|label| Bucket {
                label: (*label).to_string(),
                bounds: None,
            })
            .collect(),
        assignments: positions.iter().map(|&p| Some(p)).collect(),
    }
}

pub fn write_performance_tsv(table: &[BucketPerformance], path: &Path) -> Result<(), EvaluationError> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;
    for row in table {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}
