//! # Bucketing of Continuous and Discrete Values
//!
//! Continuous values are assigned to half-open buckets `[edges[i], edges[i+1])` with
//! an open-ended last bucket `[edges[last], +inf)`. A bucket below the first edge
//! exists only when some value actually falls there. A value equal to an edge
//! belongs to the bucket that edge opens.
//!
//! Labels are a presentation concern: `prettify` changes how a bucket is printed,
//! never which bucket a value lands in. Minimum-count thresholds are applied by
//! callers, not here.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BinningError {
    #[error("At least one bin edge is required.")]
    EmptyEdges,
    #[error("Bin edges must be strictly increasing (edge {index} is {value}, previous is {previous}).")]
    UnsortedEdges { index: usize, value: f64, previous: f64 },
    #[error("Bin edges must be finite, got {0}.")]
    NonFiniteEdge(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub label: String,
    /// `None` for discrete groups.
    pub bounds: Option<(f64, f64)>,
}

/// Buckets plus the bucket of every input row (`None` for NaN or missing input).
#[derive(Debug, Clone, PartialEq)]
pub struct Binned {
    pub buckets: Vec<Bucket>,
    pub assignments: Vec<Option<usize>>,
}

impl Binned {
    pub fn labels(&self) -> Vec<&str> {
        self.buckets.iter().map(|b| b.label.as_str()).collect()
    }

    /// Number of rows in every bucket.
    pub fn counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.buckets.len()];
        for bucket in self.assignments.iter().flatten() {
            counts[*bucket] += 1;
        }
        counts
    }

    /// The label of every row's bucket.
    pub fn row_labels(&self) -> Vec<Option<&str>> {
        self.assignments
            .iter()
            .map(|a| a.map(|i| self.buckets[i].label.as_str()))
            .collect()
    }

    /// The size of every row's bucket.
    pub fn counts_per_row(&self) -> Vec<Option<usize>> {
        let counts = self.counts();
        self.assignments.iter().map(|a| a.map(|i| counts[i])).collect()
    }

    /// Row indices of every bucket, in row order.
    pub fn rows_per_bucket(&self) -> Vec<Vec<usize>> {
        let mut rows = vec![Vec::new(); self.buckets.len()];
        for (row, bucket) in self.assignments.iter().enumerate() {
            if let Some(b) = bucket {
                rows[*b].push(row);
            }
        }
        rows
    }
}

fn format_edge(edge: f64) -> String {
    if edge.fract() == 0.0 && edge.abs() < 1e15 {
        format!("{}", edge as i64)
    } else {
        format!("{edge}")
    }
}

fn interval_label(lower: f64, upper: f64, prettify: bool) -> String {
    match (lower.is_finite(), upper.is_finite(), prettify) {
        (false, _, false) => format!("(-inf, {})", format_edge(upper)),
        (_, false, false) => format!("[{}, +inf)", format_edge(lower)),
        (true, true, false) => format!("[{}, {})", format_edge(lower), format_edge(upper)),
        (false, _, true) => format!("<{}", format_edge(upper)),
        (_, false, true) => format!("{}+", format_edge(lower)),
        (true, true, true) => {
            if lower.fract() == 0.0 && upper.fract() == 0.0 {
                let last = upper - 1.0;
                if last <= lower {
                    format_edge(lower)
                } else {
                    format!("{}-{}", format_edge(lower), format_edge(last))
                }
            } else {
                format!("{}-{}", format_edge(lower), format_edge(upper))
            }
        }
    }
}

/// Assigns every value to a bucket delimited by `edges`.
pub fn bin_continuous(values: &[f64], edges: &[f64], prettify: bool) -> Result<Binned, BinningError> {
    let (&first, _) = edges.split_first().ok_or(BinningError::EmptyEdges)?;
    for (index, window) in edges.windows(2).enumerate() {
        if window[1] <= window[0] {
            return Err(BinningError::UnsortedEdges {
                index: index + 1,
                value: window[1],
                previous: window[0],
            });
        }
    }
    if let Some(&bad) = edges.iter().find(|e| !e.is_finite()) {
        return Err(BinningError::NonFiniteEdge(bad));
    }

    let has_underflow = values.iter().any(|&v| v < first);
    let offset = usize::from(has_underflow);

    let mut buckets = Vec::with_capacity(edges.len() + offset);
    if has_underflow {
        buckets.push(Bucket {
            label: interval_label(f64::NEG_INFINITY, first, prettify),
            bounds: Some((f64::NEG_INFINITY, first)),
        });
    }
    for (i, &lower) in edges.iter().enumerate() {
        let upper = edges.get(i + 1).copied().unwrap_or(f64::INFINITY);
        buckets.push(Bucket {
            label: interval_label(lower, upper, prettify),
            bounds: Some((lower, upper)),
        });
    }

    let assignments = values
        .iter()
        .map(|&v| {
            if v.is_nan() {
                None
            } else if v < first {
                Some(0)
            } else {
                // Number of edges <= v, minus one, is the bucket that edge opens.
                Some(edges.partition_point(|&e| e <= v) - 1 + offset)
            }
        })
        .collect();

    Ok(Binned { buckets, assignments })
}

/// Groups already-categorical values without binning. Groups are sorted by label.
pub fn group_discrete<S: AsRef<str>>(values: &[Option<S>]) -> Binned {
    let mut labels: Vec<&str> = values.iter().flatten().map(|s| s.as_ref()).collect();
    labels.sort_unstable();
    labels.dedup();

    let assignments = values
        .iter()
        .map(|v| {
            v.as_ref()
                .and_then(|s| labels.binary_search(&s.as_ref()).ok())
        })
        .collect();
    Binned {
        buckets: labels
            .iter()
            .map(|l| Bucket {
                label: (*l).to_string(),
                bounds: None,
            })
            .collect(),
        assignments,
    }
}
