//! Process-local time-window rate limiter
//!
//! Used to throttle repeated alerts. Each key remembers the Unix second it
//! last fired; a check passes when at least `window_secs` have elapsed since
//! then, or when the key has never fired. Entries are never evicted: alert
//! keys form a small bounded set.
//!
//! # Examples
//!
//! ```
//! use prometheus_singleton_cron::limiter::RateLimiter;
//!
//! let limiter = RateLimiter::new();
//! assert!(limiter.check_at("cron.alarm:sync", 3600, 1_000));
//! assert!(!limiter.check_at("cron.alarm:sync", 3600, 1_500));
//! assert!(limiter.check_at("cron.alarm:sync", 3600, 4_600));
//! ```

use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::util::unix_secs;

/// Keyed last-fired timestamps.
#[derive(Debug, Default)]
pub struct RateLimiter {
    last_fired: DashMap<String, i64>,
}

impl RateLimiter {
    /// Create an empty limiter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide limiter. Dispatchers use it unless given their own.
    pub fn global() -> &'static Arc<Self> {
        static GLOBAL: OnceLock<Arc<RateLimiter>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(Self::new()))
    }

    /// Check `key` against the current time.
    pub fn check(&self, key: &str, window_secs: i64) -> bool {
        self.check_at(key, window_secs, unix_secs())
    }

    /// Check `key` at `now` (Unix seconds). Records `now` when allowed.
    pub fn check_at(&self, key: &str, window_secs: i64, now: i64) -> bool {
        match self.last_fired.entry(key.to_owned()) {
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
            Entry::Occupied(mut slot) => {
                if now - *slot.get() < window_secs {
                    return false;
                }
                slot.insert(now);
                true
            }
        }
    }

    /// Number of keys ever recorded.
    pub fn len(&self) -> usize {
        self.last_fired.len()
    }

    /// True when no key was ever recorded.
    pub fn is_empty(&self) -> bool {
        self.last_fired.is_empty()
    }
}

/// Check `key` against the process-wide limiter.
pub fn check_limiter(key: &str, window_secs: i64) -> bool {
    RateLimiter::global().check(key, window_secs)
}
