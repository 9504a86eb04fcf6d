//! # Prediction-Time Filter
//!
//! Removes prediction times that fall inside a quarantine period opened by a
//! triggering event. A prediction time at `t` for entity `e` is quarantined when
//! some trigger `q` of `e` satisfies `0 < t - q < interval`. The trigger instant
//! itself is NOT quarantined, and neither is the instant the interval closes.

use crate::errors::{ConfigurationError, FlattenError};
use crate::types::{EntityId, EventTable, PredictionTimes, Timestamp};
use ahash::AHashMap;
use chrono::TimeDelta;

/// Drops quarantined prediction times, preserving the order of the survivors.
///
/// Supplying neither `quarantine_events` nor `quarantine_interval_days` is a no-op.
/// Supplying exactly one of them is a configuration error. Only the entity and
/// timestamp columns of `quarantine_events` are consulted.
pub fn filter_prediction_times(
    prediction_times: &PredictionTimes,
    quarantine_events: Option<&EventTable>,
    quarantine_interval_days: Option<u32>,
) -> Result<PredictionTimes, FlattenError> {
    let (events, interval_days) = match (quarantine_events, quarantine_interval_days) {
        (None, None) => return Ok(prediction_times.clone()),
        (Some(events), Some(days)) => (events, days),
        (events, days) => {
            return Err(ConfigurationError::QuarantineIncomplete {
                has_events: events.is_some(),
                interval_days: days,
            }
            .into());
        }
    };

    let triggers = triggers_by_entity(events);
    let interval = TimeDelta::days(i64::from(interval_days));

    let keep: Vec<bool> = prediction_times
        .entity_ids()
        .iter()
        .zip(prediction_times.timestamps())
        .map(|(entity, &t)| match triggers.get(entity) {
            Some(sorted) => !is_quarantined(sorted, t, interval),
            None => true,
        })
        .collect();

    let filtered = prediction_times.retain_mask(&keep);
    log::info!(
        "Quarantine ({} days, source '{}') removed {} of {} prediction times",
        interval_days,
        events.name(),
        prediction_times.len() - filtered.len(),
        prediction_times.len()
    );
    Ok(filtered)
}

fn triggers_by_entity(events: &EventTable) -> AHashMap<EntityId, Vec<Timestamp>> {
    let mut triggers: AHashMap<EntityId, Vec<Timestamp>> = AHashMap::new();
    for (&entity, &ts) in events.entity_ids().iter().zip(events.timestamps()) {
        triggers.entry(entity).or_default().push(ts);
    }
    for list in triggers.values_mut() {
        list.sort_unstable();
    }
    triggers
}

/// The trigger closest before `t` yields the smallest positive elapsed time, so it
/// alone decides whether any trigger quarantines `t`.
fn is_quarantined(sorted_triggers: &[Timestamp], t: Timestamp, interval: TimeDelta) -> bool {
    let strictly_before = sorted_triggers.partition_point(|&q| q < t);
    if strictly_before == 0 {
        return false;
    }
    let elapsed = t - sorted_triggers[strictly_before - 1];
    elapsed < interval
}
