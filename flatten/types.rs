// ========================================================================================
//                             High-Level Data Contracts
// ========================================================================================

// This file is ONLY for types that are SHARED BETWEEN FILES, not types that only are used in one file.

use crate::errors::{ConfigurationError, FlattenError};
use ahash::{AHashMap, AHashSet, RandomState};
use chrono::NaiveDateTime;
use std::hash::{BuildHasher, Hash, Hasher};

pub type EntityId = i64;
pub type Timestamp = NaiveDateTime;

/// Fixed seeds so fingerprints are stable for the lifetime of a process and across
/// processes built from the same dependency versions.
const FINGERPRINT_SEEDS: [u64; 4] = [
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
];

pub(crate) fn fingerprint_hasher() -> impl Hasher {
    RandomState::with_seeds(
        FINGERPRINT_SEEDS[0],
        FINGERPRINT_SEEDS[1],
        FINGERPRINT_SEEDS[2],
        FINGERPRINT_SEEDS[3],
    )
    .build_hasher()
}

/// The stable join key used for a prediction time throughout the pipeline.
pub fn pred_time_uuid(entity_id: EntityId, timestamp: Timestamp) -> String {
    format!("{entity_id}-{}", timestamp.format("%Y-%m-%d-%H%M%S"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Numeric,
    Text,
}

/// The value column of a raw event table.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueColumn {
    Numeric(Vec<f64>),
    Text(Vec<String>),
}

impl ValueColumn {
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Numeric(_) => ValueKind::Numeric,
            Self::Text(_) => ValueKind::Text,
        }
    }
}

/// One clinical signal normalised to `{entity_id, timestamp, value}`.
#[derive(Debug, Clone)]
pub struct EventTable {
    name: String,
    entity_ids: Vec<EntityId>,
    timestamps: Vec<Timestamp>,
    values: ValueColumn,
}

impl EventTable {
    pub fn new(
        name: impl Into<String>,
        entity_ids: Vec<EntityId>,
        timestamps: Vec<Timestamp>,
        values: ValueColumn,
    ) -> Result<Self, FlattenError> {
        let name = name.into();
        if entity_ids.len() != timestamps.len() || entity_ids.len() != values.len() {
            return Err(FlattenError::LengthMismatch { table: name });
        }
        Ok(Self {
            name,
            entity_ids,
            timestamps,
            values,
        })
    }

    pub fn from_numeric_rows(name: impl Into<String>, rows: &[(EntityId, Timestamp, f64)]) -> Self {
        Self {
            name: name.into(),
            entity_ids: rows.iter().map(|r| r.0).collect(),
            timestamps: rows.iter().map(|r| r.1).collect(),
            values: ValueColumn::Numeric(rows.iter().map(|r| r.2).collect()),
        }
    }

    pub fn from_text_rows(name: impl Into<String>, rows: &[(EntityId, Timestamp, &str)]) -> Self {
        Self {
            name: name.into(),
            entity_ids: rows.iter().map(|r| r.0).collect(),
            timestamps: rows.iter().map(|r| r.1).collect(),
            values: ValueColumn::Text(rows.iter().map(|r| r.2.to_string()).collect()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity_ids(&self) -> &[EntityId] {
        &self.entity_ids
    }

    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    pub fn values(&self) -> &ValueColumn {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.entity_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }

    pub fn timestamp_range(&self) -> Option<(Timestamp, Timestamp)> {
        let min = self.timestamps.iter().min()?;
        let max = self.timestamps.iter().max()?;
        Some((*min, *max))
    }

    /// A content hash over entities, timestamps and values.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = fingerprint_hasher();
        self.name.hash(&mut hasher);
        self.entity_ids.hash(&mut hasher);
        self.timestamps.hash(&mut hasher);
        match &self.values {
            ValueColumn::Numeric(v) => {
                for x in v {
                    x.to_bits().hash(&mut hasher);
                }
            }
            ValueColumn::Text(v) => v.hash(&mut hasher),
        }
        hasher.finish()
    }
}

/// The candidate moments at which a prediction is made, unique per (entity, timestamp).
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionTimes {
    entity_ids: Vec<EntityId>,
    timestamps: Vec<Timestamp>,
    uuids: Vec<String>,
}

impl PredictionTimes {
    /// Builds the table, keeping the first occurrence of every (entity, timestamp) pair.
    pub fn new(entity_ids: Vec<EntityId>, timestamps: Vec<Timestamp>) -> Result<Self, FlattenError> {
        if entity_ids.len() != timestamps.len() {
            return Err(FlattenError::LengthMismatch {
                table: "prediction_times".to_string(),
            });
        }
        Ok(Self::deduplicated(&entity_ids, &timestamps))
    }

    pub fn from_pairs(pairs: &[(EntityId, Timestamp)]) -> Self {
        let entity_ids: Vec<EntityId> = pairs.iter().map(|p| p.0).collect();
        let timestamps: Vec<Timestamp> = pairs.iter().map(|p| p.1).collect();
        Self::deduplicated(&entity_ids, &timestamps)
    }

    fn deduplicated(entity_ids: &[EntityId], timestamps: &[Timestamp]) -> Self {
        let mut seen: AHashSet<(EntityId, Timestamp)> = AHashSet::with_capacity(entity_ids.len());
        let mut kept_ids = Vec::with_capacity(entity_ids.len());
        let mut kept_ts = Vec::with_capacity(timestamps.len());
        for (&id, &ts) in entity_ids.iter().zip(timestamps.iter()) {
            if seen.insert((id, ts)) {
                kept_ids.push(id);
                kept_ts.push(ts);
            }
        }
        let duplicates = entity_ids.len() - kept_ids.len();
        if duplicates > 0 {
            log::info!("Dropped {duplicates} duplicated prediction times");
        }
        let uuids = kept_ids
            .iter()
            .zip(kept_ts.iter())
            .map(|(&id, &ts)| pred_time_uuid(id, ts))
            .collect();
        Self {
            entity_ids: kept_ids,
            timestamps: kept_ts,
            uuids,
        }
    }

    pub fn len(&self) -> usize {
        self.entity_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }

    pub fn entity_ids(&self) -> &[EntityId] {
        &self.entity_ids
    }

    pub fn timestamps(&self) -> &[Timestamp] {
        &self.timestamps
    }

    pub fn uuids(&self) -> &[String] {
        &self.uuids
    }

    pub fn get(&self, row: usize) -> (EntityId, Timestamp) {
        (self.entity_ids[row], self.timestamps[row])
    }

    /// Keeps the rows whose mask entry is `true`, preserving order and uuids.
    pub fn retain_mask(&self, keep: &[bool]) -> Self {
        let rows: Vec<usize> = keep
            .iter()
            .enumerate()
            .filter_map(|(i, &k)| k.then_some(i))
            .collect();
        self.select(&rows)
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            entity_ids: rows.iter().map(|&r| self.entity_ids[r]).collect(),
            timestamps: rows.iter().map(|&r| self.timestamps[r]).collect(),
            uuids: rows.iter().map(|&r| self.uuids[r].clone()).collect(),
        }
    }

    pub fn fingerprint(&self) -> u64 {
        let mut hasher = fingerprint_hasher();
        self.entity_ids.hash(&mut hasher);
        self.timestamps.hash(&mut hasher);
        hasher.finish()
    }
}

/// Entity-level values with no time dimension (e.g. sex).
#[derive(Debug, Clone)]
pub struct StaticTable {
    pub name: String,
    pub entity_ids: Vec<EntityId>,
    pub values: ValueColumn,
    pub fallback: f64,
}

/// Birthdates used to derive age at every prediction time.
#[derive(Debug, Clone)]
pub struct BirthdateTable {
    pub entity_ids: Vec<EntityId>,
    pub birthdates: Vec<Timestamp>,
}

/// All loaded event tables, addressed by the source name specifications refer to.
#[derive(Debug, Default)]
pub struct SourceRegistry {
    tables: AHashMap<String, EventTable>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, table: EventTable) {
        self.tables.insert(table.name().to_string(), table);
    }

    pub fn get(&self, name: &str) -> Result<&EventTable, ConfigurationError> {
        self.tables
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownSource(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

/// A resolved feature or outcome column.
#[derive(Debug, Clone, PartialEq)]
pub enum FeatureColumn {
    Numeric(Vec<f64>),
    Text(Vec<Option<String>>),
}

impl FeatureColumn {
    pub fn len(&self) -> usize {
        match self {
            Self::Numeric(v) => v.len(),
            Self::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn select(&self, rows: &[usize]) -> Self {
        match self {
            Self::Numeric(v) => Self::Numeric(rows.iter().map(|&r| v[r]).collect()),
            Self::Text(v) => Self::Text(rows.iter().map(|&r| v[r].clone()).collect()),
        }
    }

    pub fn as_numeric(&self) -> Option<&[f64]> {
        match self {
            Self::Numeric(v) => Some(v),
            Self::Text(_) => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::Timestamp;
    use chrono::{NaiveDate, TimeDelta};

    /// Midnight on the given day offset from 2020-01-01.
    pub fn day(offset: i64) -> Timestamp {
        NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            + TimeDelta::days(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::day;
    use super::*;

    #[test]
    fn pred_time_uuid_encodes_entity_and_timestamp() {
        assert_eq!(pred_time_uuid(7, day(0)), "7-2020-01-01-000000");
    }

    #[test]
    fn prediction_times_deduplicate_keeping_first_occurrence() {
        let times = PredictionTimes::from_pairs(&[(1, day(1)), (2, day(1)), (1, day(1)), (1, day(2))]);
        assert_eq!(times.len(), 3);
        assert_eq!(times.entity_ids(), &[1, 2, 1]);
        assert_eq!(times.timestamps(), &[day(1), day(1), day(2)]);
        assert_eq!(times.uuids()[2], "1-2020-01-03-000000");
    }

    #[test]
    fn event_table_rejects_ragged_columns() {
        let err = EventTable::new("hba1c", vec![1, 2], vec![day(0)], ValueColumn::Numeric(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, FlattenError::LengthMismatch { .. }));
    }

    #[test]
    fn fingerprints_change_with_content() {
        let a = EventTable::from_numeric_rows("x", &[(1, day(0), 1.0)]);
        let b = EventTable::from_numeric_rows("x", &[(1, day(0), 2.0)]);
        assert_eq!(a.fingerprint(), a.clone().fingerprint());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn registry_reports_unknown_sources() {
        let mut registry = SourceRegistry::new();
        registry.insert(EventTable::from_numeric_rows("hba1c", &[(1, day(0), 1.0)]));
        assert!(registry.get("hba1c").is_ok());
        assert!(matches!(
            registry.get("ldl"),
            Err(ConfigurationError::UnknownSource(name)) if name == "ldl"
        ));
    }
}
