//! Binary classification metrics over `(y, p)` pairs. Every metric returns NaN
//! when it is undefined on the given rows instead of failing.

use crate::evaluate::EvaluationError;
use ndarray::ArrayView1;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const DEFAULT_THRESHOLD: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    RocAuc,
    Brier,
    Sensitivity { threshold: f64 },
    Specificity { threshold: f64 },
    Ppv { threshold: f64 },
    Prevalence,
}

impl Metric {
    /// Parses a metric name; thresholded metrics take `threshold`.
    pub fn parse(name: &str, threshold: f64) -> Result<Self, EvaluationError> {
        match name.to_ascii_lowercase().as_str() {
            "auc" | "roc_auc" => Ok(Self::RocAuc),
            "brier" => Ok(Self::Brier),
            "sensitivity" | "recall" => Ok(Self::Sensitivity { threshold }),
            "specificity" => Ok(Self::Specificity { threshold }),
            "ppv" | "precision" => Ok(Self::Ppv { threshold }),
            "prevalence" => Ok(Self::Prevalence),
            _ => Err(EvaluationError::UnknownMetric(name.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RocAuc => "roc_auc",
            Self::Brier => "brier",
            Self::Sensitivity { .. } => "sensitivity",
            Self::Specificity { .. } => "specificity",
            Self::Ppv { .. } => "ppv",
            Self::Prevalence => "prevalence",
        }
    }

    /// Whether a bucket holding a single label value makes the metric undefined.
    pub fn requires_both_classes(&self) -> bool {
        matches!(self, Self::RocAuc)
    }

    /// False when `y` holds a single class and the metric needs both.
    pub fn is_defined_for(&self, y: ArrayView1<f64>) -> bool {
        if !self.requires_both_classes() {
            return true;
        }
        let n_pos = y.iter().filter(|&&t| is_positive(t)).count();
        n_pos > 0 && n_pos < y.len()
    }

    pub fn compute(&self, y: ArrayView1<f64>, p: ArrayView1<f64>) -> f64 {
        match *self {
            Self::RocAuc => roc_auc(y, p),
            Self::Brier => brier(y, p),
            Self::Sensitivity { threshold } => sensitivity(y, p, threshold),
            Self::Specificity { threshold } => specificity(y, p, threshold),
            Self::Ppv { threshold } => ppv(y, p, threshold),
            Self::Prevalence => prevalence(y),
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn is_positive(label: f64) -> bool {
    label > 0.5
}

/// Area under the ROC curve via the Mann-Whitney U statistic, with average ranks
/// for tied predictions. NaN when either class is absent.
pub fn roc_auc(y: ArrayView1<f64>, p: ArrayView1<f64>) -> f64 {
    let n = y.len();
    let n_pos = y.iter().filter(|&&t| is_positive(t)).count() as f64;
    let n_neg = n as f64 - n_pos;
    if n_pos == 0.0 || n_neg == 0.0 {
        return f64::NAN;
    }

    let mut idx: Vec<usize> = (0..n).collect();
    idx.sort_by(|&i, &j| p[i].total_cmp(&p[j]));

    let mut ranks = vec![0.0; n];
    let mut i = 0;
    while i < n {
        let mut j = i + 1;
        while j < n && p[idx[j]] == p[idx[i]] {
            j += 1;
        }
        let avg_rank = (i + j - 1) as f64 / 2.0 + 1.0;
        for k in i..j {
            ranks[idx[k]] = avg_rank;
        }
        i = j;
    }

    let sum_ranks_pos: f64 = (0..n).filter(|&i| is_positive(y[i])).map(|i| ranks[i]).sum();
    (sum_ranks_pos - n_pos * (n_pos + 1.0) / 2.0) / (n_pos * n_neg)
}

pub fn brier(y: ArrayView1<f64>, p: ArrayView1<f64>) -> f64 {
    if y.is_empty() {
        return f64::NAN;
    }
    y.iter().zip(p.iter()).map(|(t, q)| (q - t).powi(2)).sum::<f64>() / y.len() as f64
}

struct Confusion {
    tp: usize,
    fp: usize,
    tn: usize,
    fn_: usize,
}

fn confusion(y: ArrayView1<f64>, p: ArrayView1<f64>, threshold: f64) -> Confusion {
    let mut c = Confusion {
        tp: 0,
        fp: 0,
        tn: 0,
        fn_: 0,
    };
    for (&t, &q) in y.iter().zip(p.iter()) {
        match (is_positive(t), q >= threshold) {
            (true, true) => c.tp += 1,
            (false, true) => c.fp += 1,
            (false, false) => c.tn += 1,
            (true, false) => c.fn_ += 1,
        }
    }
    c
}

fn ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        f64::NAN
    } else {
        numerator as f64 / denominator as f64
    }
}

pub fn sensitivity(y: ArrayView1<f64>, p: ArrayView1<f64>, threshold: f64) -> f64 {
    let c = confusion(y, p, threshold);
    ratio(c.tp, c.tp + c.fn_)
}

pub fn specificity(y: ArrayView1<f64>, p: ArrayView1<f64>, threshold: f64) -> f64 {
    let c = confusion(y, p, threshold);
    ratio(c.tn, c.tn + c.fp)
}

pub fn ppv(y: ArrayView1<f64>, p: ArrayView1<f64>, threshold: f64) -> f64 {
    let c = confusion(y, p, threshold);
    ratio(c.tp, c.tp + c.fp)
}

pub fn prevalence(y: ArrayView1<f64>) -> f64 {
    ratio(y.iter().filter(|&&t| is_positive(t)).count(), y.len())
}
