// ========================================================================================
//
//                      THE WINDOWED AGGREGATION KERNEL
//
// ========================================================================================
//
// Resolves one `TemporalSpec` against one event table. Events are sorted once by
// (entity, timestamp, original row) and indexed per entity, so every prediction time
// locates its window with two binary searches instead of scanning the whole table.
// Ties on timestamp are broken by the original row index, which makes `latest` a
// stable last-write-wins and `earliest` a stable first-write-wins.

use crate::spec::{Aggregation, Direction, TemporalSpec};
use crate::types::{EntityId, EventTable, FeatureColumn, PredictionTimes, Timestamp, ValueColumn};
use ahash::AHashMap;
use chrono::TimeDelta;
use rayon::prelude::*;
use std::ops::Range;

/// A per-entity sorted view over an event table.
pub struct EntityIndex<'a> {
    table: &'a EventTable,
    order: Vec<usize>,
    sorted_timestamps: Vec<Timestamp>,
    ranges: AHashMap<EntityId, Range<usize>>,
}

impl<'a> EntityIndex<'a> {
    pub fn build(table: &'a EventTable) -> Self {
        let ids = table.entity_ids();
        let ts = table.timestamps();
        let mut order: Vec<usize> = (0..table.len()).collect();
        order.par_sort_unstable_by_key(|&i| (ids[i], ts[i], i));

        let sorted_timestamps: Vec<Timestamp> = order.iter().map(|&i| ts[i]).collect();
        let mut ranges: AHashMap<EntityId, Range<usize>> = AHashMap::new();
        let mut start = 0;
        while start < order.len() {
            let entity = ids[order[start]];
            let mut end = start + 1;
            while end < order.len() && ids[order[end]] == entity {
                end += 1;
            }
            ranges.insert(entity, start..end);
            start = end;
        }

        Self {
            table,
            order,
            sorted_timestamps,
            ranges,
        }
    }

    pub fn table(&self) -> &'a EventTable {
        self.table
    }

    /// Original row indices of the entity's events in `(lower, upper]`, chronologically.
    pub fn window(&self, entity: EntityId, lower_exclusive: Timestamp, upper_inclusive: Timestamp) -> &[usize] {
        let Some(range) = self.ranges.get(&entity) else {
            return &[];
        };
        let stamps = &self.sorted_timestamps[range.clone()];
        let begin = stamps.partition_point(|&t| t <= lower_exclusive);
        let end = stamps.partition_point(|&t| t <= upper_inclusive);
        if begin >= end {
            return &[];
        }
        &self.order[range.start + begin..range.start + end]
    }

    /// The earliest event timestamp of every entity.
    pub fn first_timestamps(&self) -> AHashMap<EntityId, Timestamp> {
        self.ranges
            .iter()
            .map(|(&entity, range)| (entity, self.sorted_timestamps[range.start]))
            .collect()
    }
}

/// `t` moved `days` into the past, clamped to the earliest representable instant.
pub(crate) fn days_before(t: Timestamp, days: u32) -> Timestamp {
    t.checked_sub_signed(TimeDelta::days(i64::from(days)))
        .unwrap_or(Timestamp::MIN)
}

/// `t` moved `days` into the future, clamped to the latest representable instant.
pub(crate) fn days_after(t: Timestamp, days: u32) -> Timestamp {
    t.checked_add_signed(TimeDelta::days(i64::from(days)))
        .unwrap_or(Timestamp::MAX)
}

/// The `(lower_exclusive, upper_inclusive]` bounds of the window anchored at `t`.
pub fn window_bounds(t: Timestamp, direction: Direction, interval_days: u32) -> (Timestamp, Timestamp) {
    match direction {
        Direction::Behind => (days_before(t, interval_days), t),
        Direction::Ahead => (t, days_after(t, interval_days)),
    }
}

/// The outcome of aggregating one window.
#[derive(Debug, Clone, PartialEq)]
pub enum Aggregated {
    Number(f64),
    Text(String),
}

/// Collapses the events at `rows` (chronological) into one value.
///
/// Returns `None` when the window has nothing to aggregate and the fallback applies.
/// NaN raw values are ignored by every numeric reduction.
pub fn aggregate(values: &ValueColumn, timestamps: &[Timestamp], rows: &[usize], aggregation: Aggregation) -> Option<Aggregated> {
    match aggregation {
        Aggregation::Count => return Some(Aggregated::Number(rows.len() as f64)),
        Aggregation::Bool => return (!rows.is_empty()).then_some(Aggregated::Number(1.0)),
        _ => {}
    }

    match values {
        ValueColumn::Text(text) => match aggregation {
            Aggregation::Latest => rows.last().map(|&r| Aggregated::Text(text[r].clone())),
            Aggregation::Earliest => rows.first().map(|&r| Aggregated::Text(text[r].clone())),
            Aggregation::Concatenate => {
                if rows.is_empty() {
                    None
                } else {
                    let joined: Vec<&str> = rows.iter().map(|&r| text[r].as_str()).collect();
                    Some(Aggregated::Text(joined.join(" ")))
                }
            }
            _ => None,
        },
        ValueColumn::Numeric(numbers) => {
            let present: Vec<usize> = rows.iter().copied().filter(|&r| !numbers[r].is_nan()).collect();
            if present.is_empty() {
                return None;
            }
            let vals = || present.iter().map(|&r| numbers[r]);
            let n = present.len() as f64;
            let result = match aggregation {
                Aggregation::Max => vals().fold(f64::NEG_INFINITY, f64::max),
                Aggregation::Min => vals().fold(f64::INFINITY, f64::min),
                Aggregation::Sum => vals().sum(),
                Aggregation::Mean => vals().sum::<f64>() / n,
                Aggregation::Latest => numbers[*present.last()?],
                Aggregation::Earliest => numbers[*present.first()?],
                Aggregation::Variance => {
                    if present.len() < 2 {
                        return None;
                    }
                    let mean = vals().sum::<f64>() / n;
                    vals().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
                }
                Aggregation::ChangePerDay => slope_per_day(&present, numbers, timestamps)?,
                Aggregation::Count | Aggregation::Bool | Aggregation::Concatenate => return None,
            };
            Some(Aggregated::Number(result))
        }
    }
}

/// Least-squares slope of value against elapsed days.
fn slope_per_day(rows: &[usize], numbers: &[f64], timestamps: &[Timestamp]) -> Option<f64> {
    if rows.len() < 2 {
        return None;
    }
    let origin = timestamps[rows[0]];
    let xs: Vec<f64> = rows
        .iter()
        .map(|&r| (timestamps[r] - origin).num_seconds() as f64 / 86_400.0)
        .collect();
    let n = rows.len() as f64;
    let x_mean = xs.iter().sum::<f64>() / n;
    let y_mean = rows.iter().map(|&r| numbers[r]).sum::<f64>() / n;
    let mut sxx = 0.0;
    let mut sxy = 0.0;
    for (x, &r) in xs.iter().zip(rows) {
        sxx += (x - x_mean).powi(2);
        sxy += (x - x_mean) * (numbers[r] - y_mean);
    }
    (sxx > 0.0).then(|| sxy / sxx)
}

/// A resolved column together with the number of rows that received the fallback.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedColumn {
    pub values: FeatureColumn,
    pub n_fallback: usize,
}

impl ResolvedColumn {
    pub fn fallback_proportion(&self) -> f64 {
        if self.values.is_empty() {
            0.0
        } else {
            self.n_fallback as f64 / self.values.len() as f64
        }
    }
}

/// Resolves one spec at every prediction time.
pub fn resolve_column(index: &EntityIndex<'_>, prediction_times: &PredictionTimes, spec: &TemporalSpec) -> ResolvedColumn {
    let table = index.table();
    let outputs: Vec<Option<Aggregated>> = (0..prediction_times.len())
        .into_par_iter()
        .map(|row| {
            let (entity, t) = prediction_times.get(row);
            let (lower, upper) = window_bounds(t, spec.direction, spec.interval_days);
            let rows = index.window(entity, lower, upper);
            aggregate(table.values(), table.timestamps(), rows, spec.aggregation)
        })
        .collect();

    let n_fallback = if spec.aggregation.never_falls_back() {
        0
    } else {
        outputs.iter().filter(|o| o.is_none()).count()
    };

    let text_output = matches!(spec.aggregation, Aggregation::Concatenate)
        || (matches!(table.values(), ValueColumn::Text(_))
            && matches!(spec.aggregation, Aggregation::Latest | Aggregation::Earliest));

    let values = if text_output {
        FeatureColumn::Text(
            outputs
                .into_iter()
                .map(|o| match o {
                    Some(Aggregated::Text(s)) => Some(s),
                    Some(Aggregated::Number(x)) => Some(x.to_string()),
                    None => None,
                })
                .collect(),
        )
    } else {
        FeatureColumn::Numeric(
            outputs
                .into_iter()
                .map(|o| match o {
                    Some(Aggregated::Number(x)) => x,
                    Some(Aggregated::Text(_)) | None => spec.fallback,
                })
                .collect(),
        )
    };

    ResolvedColumn { values, n_fallback }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::test_support::day;
    use approx::assert_abs_diff_eq;

    fn numeric(rows: &[(EntityId, Timestamp, f64)]) -> EventTable {
        EventTable::from_numeric_rows("lab", rows)
    }

    fn resolve(table: &EventTable, times: &PredictionTimes, spec: &TemporalSpec) -> ResolvedColumn {
        let index = EntityIndex::build(table);
        resolve_column(&index, times, spec)
    }

    #[test]
    fn window_bounds_clamp_at_the_calendar_edges() {
        let t = day(0);
        assert_eq!(window_bounds(t, Direction::Behind, 10), (day(-10), t));
        assert_eq!(window_bounds(t, Direction::Ahead, 10), (t, day(10)));
        assert_eq!(window_bounds(t, Direction::Behind, u32::MAX), (Timestamp::MIN, t));
        assert_eq!(window_bounds(t, Direction::Ahead, 200_000_000), (t, Timestamp::MAX));
    }

    #[test]
    fn mean_over_lookbehind_windows() {
        let table = numeric(&[(1, day(5), 3.0), (1, day(12), 7.0)]);
        let times = PredictionTimes::from_pairs(&[(1, day(10)), (1, day(20))]);
        let spec = TemporalSpec::predictor("lab", 10, Aggregation::Mean, f64::NAN);
        let col = resolve(&table, &times, &spec);
        assert_eq!(col.values, FeatureColumn::Numeric(vec![3.0, 7.0]));
        assert_eq!(col.n_fallback, 0);
    }

    #[test]
    fn lookbehind_excludes_far_edge_and_includes_prediction_instant() {
        let table = numeric(&[(1, day(0), 1.0), (1, day(10), 5.0)]);
        let times = PredictionTimes::from_pairs(&[(1, day(10))]);
        let spec = TemporalSpec::predictor("lab", 10, Aggregation::Count, f64::NAN);
        let col = resolve(&table, &times, &spec);
        assert_eq!(col.values, FeatureColumn::Numeric(vec![1.0]));

        let latest = TemporalSpec::predictor("lab", 10, Aggregation::Latest, f64::NAN);
        assert_eq!(resolve(&table, &times, &latest).values, FeatureColumn::Numeric(vec![5.0]));
    }

    #[test]
    fn lookahead_excludes_prediction_instant_and_includes_far_edge() {
        let table = numeric(&[(1, day(10), 1.0), (1, day(20), 1.0), (1, day(21), 1.0)]);
        let times = PredictionTimes::from_pairs(&[(1, day(10))]);
        let spec = TemporalSpec::outcome("lab", 10, Aggregation::Count, 0.0, false);
        assert_eq!(resolve(&table, &times, &spec).values, FeatureColumn::Numeric(vec![1.0]));
    }

    #[test]
    fn empty_windows_fall_back_except_for_count() {
        let table = numeric(&[(1, day(0), 2.0), (2, day(50), 4.0)]);
        let times = PredictionTimes::from_pairs(&[(1, day(5)), (2, day(5)), (3, day(5))]);

        let max = TemporalSpec::predictor("lab", 30, Aggregation::Max, -1.0);
        let col = resolve(&table, &times, &max);
        assert_eq!(col.values, FeatureColumn::Numeric(vec![2.0, -1.0, -1.0]));
        assert_eq!(col.n_fallback, 2);
        assert_abs_diff_eq!(col.fallback_proportion(), 2.0 / 3.0, epsilon = 1e-12);

        let count = TemporalSpec::predictor("lab", 30, Aggregation::Count, -1.0);
        let col = resolve(&table, &times, &count);
        assert_eq!(col.values, FeatureColumn::Numeric(vec![1.0, 0.0, 0.0]));
        assert_eq!(col.n_fallback, 0);
    }

    #[test]
    fn latest_breaks_timestamp_ties_by_last_row() {
        let table = numeric(&[(1, day(3), 10.0), (1, day(3), 20.0), (1, day(1), 30.0)]);
        let times = PredictionTimes::from_pairs(&[(1, day(5))]);
        let latest = TemporalSpec::predictor("lab", 30, Aggregation::Latest, f64::NAN);
        assert_eq!(resolve(&table, &times, &latest).values, FeatureColumn::Numeric(vec![20.0]));
        let earliest = TemporalSpec::predictor("lab", 30, Aggregation::Earliest, f64::NAN);
        assert_eq!(resolve(&table, &times, &earliest).values, FeatureColumn::Numeric(vec![30.0]));
    }

    #[test]
    fn numeric_reductions_ignore_nan_values() {
        let table = numeric(&[(1, day(1), f64::NAN), (1, day(2), 4.0), (1, day(3), f64::NAN)]);
        let times = PredictionTimes::from_pairs(&[(1, day(5))]);
        let mean = TemporalSpec::predictor("lab", 30, Aggregation::Mean, 0.0);
        assert_eq!(resolve(&table, &times, &mean).values, FeatureColumn::Numeric(vec![4.0]));
        let latest = TemporalSpec::predictor("lab", 30, Aggregation::Latest, 0.0);
        assert_eq!(resolve(&table, &times, &latest).values, FeatureColumn::Numeric(vec![4.0]));
        let count = TemporalSpec::predictor("lab", 30, Aggregation::Count, 0.0);
        assert_eq!(resolve(&table, &times, &count).values, FeatureColumn::Numeric(vec![3.0]));
    }

    #[test]
    fn variance_and_change_per_day_need_two_values() {
        let table = numeric(&[(1, day(0), 1.0), (1, day(2), 5.0), (2, day(0), 3.0)]);
        let times = PredictionTimes::from_pairs(&[(1, day(2)), (2, day(2))]);

        let var = TemporalSpec::predictor("lab", 30, Aggregation::Variance, f64::NAN);
        match resolve(&table, &times, &var).values {
            FeatureColumn::Numeric(v) => {
                assert_abs_diff_eq!(v[0], 8.0, epsilon = 1e-12);
                assert!(v[1].is_nan());
            }
            other => panic!("expected numeric column, got {other:?}"),
        }

        let slope = TemporalSpec::predictor("lab", 30, Aggregation::ChangePerDay, f64::NAN);
        match resolve(&table, &times, &slope).values {
            FeatureColumn::Numeric(v) => {
                assert_abs_diff_eq!(v[0], 2.0, epsilon = 1e-12);
                assert!(v[1].is_nan());
            }
            other => panic!("expected numeric column, got {other:?}"),
        }
    }

    #[test]
    fn concatenate_joins_text_chronologically() {
        let table = EventTable::from_text_rows(
            "notes",
            &[(1, day(3), "later"), (1, day(1), "first"), (1, day(2), "middle"), (1, day(9), "future")],
        );
        let times = PredictionTimes::from_pairs(&[(1, day(5)), (2, day(5))]);
        let spec = TemporalSpec::predictor("notes", 30, Aggregation::Concatenate, f64::NAN);
        let col = resolve(&table, &times, &spec);
        assert_eq!(
            col.values,
            FeatureColumn::Text(vec![Some("first middle later".to_string()), None])
        );
        assert_eq!(col.n_fallback, 1);
    }

    #[test]
    fn window_lookup_only_sees_the_requested_entity() {
        let table = numeric(&[(2, day(1), 1.0), (1, day(1), 2.0), (3, day(1), 3.0)]);
        let index = EntityIndex::build(&table);
        assert_eq!(index.window(1, day(0), day(2)), &[1]);
        assert!(index.window(4, day(0), day(2)).is_empty());
        assert_eq!(index.first_timestamps().len(), 3);
    }
}
