//! # Feature Cache
//!
//! An explicit, shareable cache of resolved columns. The flattener consults it by
//! reference; nothing is memoised behind the caller's back. A key identifies the
//! column by its encoded name and the exact content of the source table and the
//! prediction times it was resolved against, so stale entries can never be served
//! after either input changes.

use crate::aggregate::ResolvedColumn;
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub column_name: String,
    pub source_fingerprint: u64,
    pub prediction_times_fingerprint: u64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

#[derive(Debug, Default)]
pub struct FeatureCache {
    entries: DashMap<CacheKey, Arc<ResolvedColumn>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl FeatureCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<ResolvedColumn>> {
        match self.entries.get(key) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(entry.value()))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: CacheKey, column: Arc<ResolvedColumn>) {
        self.entries.insert(key, column);
    }

    /// Removes every entry for the given column name; returns how many were removed.
    pub fn invalidate(&self, column_name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.column_name != column_name);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}
