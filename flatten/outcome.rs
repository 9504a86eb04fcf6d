//! # Outcome Resolution
//!
//! Prevalent outcomes are resolved like any other lookahead column. Incident
//! outcomes can only happen once: every prediction time at or after an entity's
//! first outcome event is removed from the dataset before any column is resolved,
//! so the remaining rows are resolved with the ordinary windowed aggregation.

use crate::aggregate::EntityIndex;
use crate::types::{EntityId, PredictionTimes, Timestamp};
use ahash::AHashMap;

/// Rows to keep given the first outcome timestamp of each entity.
pub fn incident_keep_mask(prediction_times: &PredictionTimes, first_outcome: &AHashMap<EntityId, Timestamp>) -> Vec<bool> {
    prediction_times
        .entity_ids()
        .iter()
        .zip(prediction_times.timestamps())
        .map(|(entity, &t)| first_outcome.get(entity).is_none_or(|&first| t < first))
        .collect()
}

/// Drops prediction times at or after the first event of any of the incident outcome sources.
pub fn drop_after_incident_outcomes(prediction_times: &PredictionTimes, incident_sources: &[&EntityIndex<'_>]) -> PredictionTimes {
    if incident_sources.is_empty() {
        return prediction_times.clone();
    }
    let mut keep = vec![true; prediction_times.len()];
    for index in incident_sources {
        let first = index.first_timestamps();
        for (k, source_keep) in keep.iter_mut().zip(incident_keep_mask(prediction_times, &first)) {
            *k &= source_keep;
        }
    }
    let filtered = prediction_times.retain_mask(&keep);
    log::info!(
        "Incident outcomes removed {} of {} prediction times at or after the first outcome",
        prediction_times.len() - filtered.len(),
        prediction_times.len()
    );
    filtered
}
