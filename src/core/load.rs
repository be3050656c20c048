//! Load scores, the shared ranked set, and best-candidate selection.
//!
//! Each instance periodically publishes a [`LoadScore`] under its IP. The
//! score orders first by calendar day, then by CPU bucket, then by memory
//! bucket, so a range query restricted to today's day returns the least
//! loaded instance first.

use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::StoreError;
use crate::infra::store::SharedStore;
use crate::util::date_bucket;

/// Default name of the shared ranked set.
pub const DEFAULT_RANKED_SET_KEY: &str = "server_load_info";

/// Upper bound on the backoff a non-best instance sleeps before claiming.
pub const MAX_BACKOFF: Duration = Duration::from_millis(100);

/// Highest bucket a percentage can map to.
const MAX_BUCKET: u8 = 99;

/// Structured composite score. Lower means less loaded.
///
/// Field order is the comparison order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LoadScore {
    /// `YYYYMMDD` day the sample was taken (UTC).
    pub date: u32,
    /// CPU bucket, `0..=99`.
    pub cpu: u8,
    /// Memory bucket, `0..=99`.
    pub mem: u8,
}

impl LoadScore {
    /// Score a sample.
    pub fn from_sample(sample: &LoadSample) -> Self {
        Self {
            date: date_bucket(sample.sampled_at.date_naive()),
            cpu: percent_bucket(sample.cpu_percent),
            mem: percent_bucket(sample.mem_percent),
        }
    }

    /// Lowest score within `date`.
    pub const fn day_floor(date: u32) -> Self {
        Self { date, cpu: 0, mem: 0 }
    }

    /// Highest score within `date`.
    pub const fn day_ceiling(date: u32) -> Self {
        Self {
            date,
            cpu: MAX_BUCKET,
            mem: MAX_BUCKET,
        }
    }
}

impl std::fmt::Display for LoadScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:02}{:02}", self.date, self.cpu, self.mem)
    }
}

/// Map a percentage reading onto `0..=99`.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn percent_bucket(percent: f64) -> u8 {
    if percent.is_nan() || percent <= 0.0 {
        return 0;
    }
    // clamped before the cast, so truncation cannot occur
    percent.ceil().min(f64::from(MAX_BUCKET)) as u8
}

/// One measurement of this instance's load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadSample {
    /// Instance address; empty when it could not be determined.
    pub ip: String,
    /// Global CPU usage in percent.
    pub cpu_percent: f64,
    /// Memory usage in percent.
    pub mem_percent: f64,
    /// When the sample was taken.
    pub sampled_at: DateTime<Utc>,
}

impl LoadSample {
    /// Sample taken now.
    pub fn new(ip: impl Into<String>, cpu_percent: f64, mem_percent: f64) -> Self {
        Self {
            ip: ip.into(),
            cpu_percent,
            mem_percent,
            sampled_at: Utc::now(),
        }
    }

    /// Override the sample time.
    #[must_use]
    pub fn at(mut self, sampled_at: DateTime<Utc>) -> Self {
        self.sampled_at = sampled_at;
        self
    }

    /// Score for this sample.
    pub fn score(&self) -> LoadScore {
        LoadScore::from_sample(self)
    }
}

/// Backoff a non-best instance sleeps before trying the tick guard.
///
/// One millisecond per percent of CPU plus memory, capped at [`MAX_BACKOFF`].
/// This only gives the best candidate a head start. It is not what provides
/// mutual exclusion.
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn backoff_delay(sample: &LoadSample) -> Duration {
    let part = |p: f64| if p.is_nan() || p <= 0.0 { 0.0 } else { p.ceil() };
    let cap = MAX_BACKOFF.as_millis() as f64;
    let millis = (part(sample.cpu_percent) + part(sample.mem_percent)).min(cap);
    Duration::from_millis(millis as u64)
}

/// Publishes this instance's score into the ranked set.
#[derive(Clone)]
pub struct LoadReporter {
    store: SharedStore,
    set_key: String,
}

impl LoadReporter {
    /// Reporter writing to `set_key`.
    pub fn new(store: SharedStore, set_key: impl Into<String>) -> Self {
        Self {
            store,
            set_key: set_key.into(),
        }
    }

    /// Upsert the sample's score under its IP. Skipped when the IP is empty.
    ///
    /// # Errors
    ///
    /// Returns the store error if the upsert fails.
    pub async fn report(&self, sample: &LoadSample) -> Result<(), StoreError> {
        if sample.ip.is_empty() {
            debug!("skipping load report without an instance address");
            return Ok(());
        }
        let score = sample.score();
        self.store.rank_upsert(&self.set_key, &sample.ip, score).await?;
        debug!("reported load {} for {}", score, sample.ip);
        Ok(())
    }
}

/// Finds the least-loaded instance that reported today.
#[derive(Clone)]
pub struct BestCandidateSelector {
    store: SharedStore,
    set_key: String,
}

impl BestCandidateSelector {
    /// Selector reading from `set_key`.
    pub fn new(store: SharedStore, set_key: impl Into<String>) -> Self {
        Self {
            store,
            set_key: set_key.into(),
        }
    }

    /// Best candidate for the current UTC day.
    ///
    /// `None` means no instance reported today; callers proceed as if they
    /// were the best.
    ///
    /// # Errors
    ///
    /// Returns the store error if the range query fails.
    pub async fn best(&self) -> Result<Option<String>, StoreError> {
        self.best_for(Utc::now().date_naive()).await
    }

    /// Best candidate among reports for `date`.
    ///
    /// # Errors
    ///
    /// Returns the store error if the range query fails.
    pub async fn best_for(&self, date: NaiveDate) -> Result<Option<String>, StoreError> {
        let day = date_bucket(date);
        let members = self
            .store
            .rank_range(&self.set_key, LoadScore::day_floor(day), LoadScore::day_ceiling(day), 1)
            .await?;
        Ok(members.into_iter().next())
    }
}
