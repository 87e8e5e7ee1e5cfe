//! Last-known-good snapshot store keyed by (provider, resource).
//!
//! Single writer (the poll aggregator), many readers (query handlers).
//! Every update is a whole-entry replacement under the write lock, so a
//! reader sees either the old snapshot or the new one, never a mix.

use crate::models::{ProviderKey, ProviderSnapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;

/// Result of [`SnapshotCache::store`].
#[derive(Debug, Clone)]
pub enum StoreOutcome {
    /// The snapshot is now live; `previous` is what it replaced.
    Stored { previous: Option<Arc<ProviderSnapshot>> },
    /// A newer snapshot was already live; the incoming one was discarded.
    Superseded { current: Arc<ProviderSnapshot> },
}

#[derive(Debug, Default)]
pub struct SnapshotCache {
    entries: RwLock<HashMap<ProviderKey, Arc<ProviderSnapshot>>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ProviderKey) -> Option<Arc<ProviderSnapshot>> {
        self.entries.read().get(key).cloned()
    }

    /// Returns the snapshot only while it is younger than `ttl`.
    pub fn get_fresh(&self, key: &ProviderKey, ttl: Duration, now: OffsetDateTime) -> Option<Arc<ProviderSnapshot>> {
        self.get(key).filter(|s| s.is_fresh(ttl, now))
    }

    /// Replaces the entry unless the live one was fetched later.
    pub fn store(&self, snapshot: Arc<ProviderSnapshot>) -> StoreOutcome {
        let mut entries = self.entries.write();
        if let Some(current) = entries.get(&snapshot.key) {
            if current.fetched_at > snapshot.fetched_at {
                return StoreOutcome::Superseded { current: current.clone() };
            }
        }
        let previous = entries.insert(snapshot.key.clone(), snapshot);
        StoreOutcome::Stored { previous }
    }

    pub fn snapshots_for(&self, provider_id: &str) -> Vec<Arc<ProviderSnapshot>> {
        let mut list: Vec<_> = self
            .entries
            .read()
            .values()
            .filter(|s| s.key.provider_id == provider_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
