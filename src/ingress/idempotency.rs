// =============================================================================
// Idempotency cache — (profile, key) → the full cached Decision
// =============================================================================
//
// Replays within the TTL serve the stored Decision byte-for-byte. Entries
// expire lazily on read and eagerly via `sweep`, which the signal-expiration
// reconciler runs as its janitor duty. A per-profile capacity bound evicts
// oldest-first as a backstop; the rate limiter keeps writes low enough that
// overflow is exceedingly rare.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use crate::decision::Decision;

struct CacheEntry {
    key: String,
    cached_at: DateTime<Utc>,
    decision: Decision,
}

#[derive(Default)]
pub struct IdempotencyCache {
    inner: RwLock<HashMap<Uuid, Vec<CacheEntry>>>,
}

impl IdempotencyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a cached Decision, removing any expired entries for the
    /// profile on the way.
    pub fn lookup(
        &self,
        profile_id: Uuid,
        key: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Option<Decision> {
        let mut inner = self.inner.write();
        let entries = inner.get_mut(&profile_id)?;
        entries.retain(|e| now - e.cached_at < ttl);
        let hit = entries
            .iter()
            .find(|e| e.key == key)
            .map(|e| e.decision.clone());
        if entries.is_empty() {
            inner.remove(&profile_id);
        }
        hit
    }

    /// Cache a Decision under its (profile, key). Oldest-out past `capacity`.
    pub fn insert(
        &self,
        profile_id: Uuid,
        key: &str,
        decision: Decision,
        now: DateTime<Utc>,
        capacity: usize,
    ) {
        let mut inner = self.inner.write();
        let entries = inner.entry(profile_id).or_default();
        entries.retain(|e| e.key != key);
        entries.push(CacheEntry {
            key: key.to_string(),
            cached_at: now,
            decision,
        });
        while entries.len() > capacity.max(1) {
            entries.remove(0);
        }
    }

    /// Eager janitor pass. Returns how many entries were dropped.
    pub fn sweep(&self, now: DateTime<Utc>, ttl: Duration) -> usize {
        let mut inner = self.inner.write();
        let before: usize = inner.values().map(Vec::len).sum();
        for entries in inner.values_mut() {
            entries.retain(|e| now - e.cached_at < ttl);
        }
        inner.retain(|_, entries| !entries.is_empty());
        let after: usize = inner.values().map(Vec::len).sum();
        before - after
    }

    pub fn len(&self) -> usize {
        self.inner.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
