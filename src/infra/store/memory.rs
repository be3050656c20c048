//! In-memory store with TTL expiry and ranked sets.
//!
//! Expiry is measured on the tokio clock, so tests can pause and advance time
//! instead of sleeping. Expired keys are dropped when touched, and every
//! [`SWEEP_EVERY`] writes a sweep drops the rest, since tick keys are unique
//! per tick and are rarely touched again.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::core::{LoadScore, StoreError};

use super::LeaseStore;

/// Writes between two sweeps of expired keys.
pub const SWEEP_EVERY: usize = 64;

struct StoredValue {
    value: String,
    expires_at: Instant,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Scores keyed by member plus an ordered index for range queries.
#[derive(Default)]
struct RankedSet {
    scores: HashMap<String, LoadScore>,
    order: BTreeSet<(LoadScore, String)>,
}

impl RankedSet {
    fn upsert(&mut self, member: &str, score: LoadScore) {
        if let Some(old) = self.scores.insert(member.to_owned(), score) {
            self.order.remove(&(old, member.to_owned()));
        }
        self.order.insert((score, member.to_owned()));
    }
}

/// Process-local [`LeaseStore`] for tests, benchmarks and single-node use.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, StoredValue>>,
    ranked: Mutex<HashMap<String, RankedSet>>,
    unavailable: AtomicBool,
    writes: AtomicUsize,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`] while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    /// Overwrite `key` regardless of its current holder.
    pub fn force_set(&self, key: &str, value: &str, ttl: Duration) {
        self.entries.lock().insert(
            key.to_owned(),
            StoredValue {
                value: value.to_owned(),
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Remaining lifetime of `key`, if it is live.
    pub fn remaining_ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.expires_at - now)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|v| v.is_live(now)).count()
    }

    /// True when no live keys remain.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(StoreError::Unavailable("in-memory store switched off".into()));
        }
        Ok(())
    }

    /// Run `f` against the live entry at `key`, purging it first if expired.
    fn with_live<R>(&self, key: &str, f: impl FnOnce(Option<&mut StoredValue>) -> R) -> R {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|v| !v.is_live(now)) {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }

    /// Count a write and sweep expired keys once every [`SWEEP_EVERY`] writes.
    fn note_write(&self, entries: &mut HashMap<String, StoredValue>, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            entries.retain(|_, v| v.is_live(now));
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        if entries.get(key).is_some_and(|v| v.is_live(now)) {
            return Ok(false);
        }
        entries.insert(
            key.to_owned(),
            StoredValue {
                value: value.to_owned(),
                expires_at: now + ttl,
            },
        );
        self.note_write(&mut entries, now);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        Ok(self.with_live(key, |v| v.map(|v| v.value.clone())))
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(v) if v.is_live(now) && v.value == expected => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.with_live(key, |v| match v {
            Some(v) if v.value == expected => {
                v.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }))
    }

    async fn rank_upsert(&self, set: &str, member: &str, score: LoadScore) -> Result<(), StoreError> {
        self.check_available()?;
        self.ranked
            .lock()
            .entry(set.to_owned())
            .or_default()
            .upsert(member, score);
        Ok(())
    }

    async fn rank_range(
        &self,
        set: &str,
        min: LoadScore,
        max: LoadScore,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        self.check_available()?;
        let ranked = self.ranked.lock();
        let Some(set) = ranked.get(set) else {
            return Ok(Vec::new());
        };
        Ok(set
            .order
            .iter()
            .filter(|(score, _)| *score >= min && *score <= max)
            .take(limit)
            .map(|(_, member)| member.clone())
            .collect())
    }
}
