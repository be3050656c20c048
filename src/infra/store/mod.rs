//! Shared key-value store backends.
//!
//! Every instance in the fleet talks to the same store. The trait is the only
//! thing the lease and load-ranking code depend on, so a Redis-backed client,
//! a test fake, and [`InMemoryStore`] are interchangeable.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::core::{LoadScore, StoreError};

pub use memory::InMemoryStore;

/// Store handle passed down to every component that needs one.
pub type SharedStore = Arc<dyn LeaseStore>;

/// Abstraction over the shared store.
///
/// Ownership checks must be single atomic operations on the server side
/// (a script or transaction for Redis), never a read followed by a write.
#[async_trait]
pub trait LeaseStore: Send + Sync + 'static {
    /// Set `key` to `value` with `ttl` only if the key is absent.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Read the live value at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete `key` only if it currently holds `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    /// Reset the TTL of `key` only if it currently holds `expected`.
    async fn compare_and_expire(
        &self,
        key: &str,
        expected: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Insert or overwrite `member`'s score in the ranked set `set`.
    async fn rank_upsert(&self, set: &str, member: &str, score: LoadScore) -> Result<(), StoreError>;

    /// Members with `min <= score <= max`, ascending, at most `limit` of them.
    async fn rank_range(
        &self,
        set: &str,
        min: LoadScore,
        max: LoadScore,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
}
