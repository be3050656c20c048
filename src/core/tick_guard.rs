//! Two-key guard for one scheduled tick of a job.
//!
//! The tick key (`cron_<job><bucket>`) marks a tick as claimed and is kept
//! until it expires, so a slower instance can never run a tick that already
//! ran. The run key (`exec_<job>`) marks the job as executing and is cleared
//! on release. Only the run key is renewed.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::lease::{DistributedLease, LeaseClaim, LeaseOptions};
use crate::core::LockError;
use crate::infra::store::SharedStore;
use crate::util::tick_bucket;

/// Default time the run key outlives the tick key.
pub const DEFAULT_RUN_KEY_MARGIN: Duration = Duration::from_secs(3);

/// Attempts made by [`first_run_fence`].
pub const FENCE_ATTEMPTS: usize = 2;

/// Pause after each failed fence attempt.
pub const FENCE_RETRY_PAUSE: Duration = Duration::from_millis(100);

/// Tick-scoped key for `job` at `tick`.
pub fn tick_key(job: &str, tick: DateTime<Utc>) -> String {
    format!("cron_{job}{}", tick_bucket(tick))
}

/// Job-scoped run key.
pub fn run_key(job: &str) -> String {
    format!("exec_{job}")
}

/// Job-scoped first-run fence key.
pub fn fence_key(job: &str) -> String {
    format!("exec_{job}:fence")
}

/// Options for [`TickGuard`].
#[derive(Debug, Clone)]
pub struct TickGuardOptions {
    /// Extra lifetime of the run key beyond the tick TTL.
    pub run_key_margin: Duration,
    /// Renew the run key while the job executes.
    pub auto_renew: bool,
    /// Base lease options (token, cancellation).
    pub lease: LeaseOptions,
}

impl Default for TickGuardOptions {
    fn default() -> Self {
        Self {
            run_key_margin: DEFAULT_RUN_KEY_MARGIN,
            auto_renew: true,
            lease: LeaseOptions::default(),
        }
    }
}

/// Lease over the tick key and the run key, sharing one token.
#[derive(Debug)]
pub struct TickGuard {
    job: String,
    tick: DateTime<Utc>,
    tick_ttl: Duration,
    lease: DistributedLease,
}

impl TickGuard {
    /// Guard for `job` at `tick`. The run key lives `tick_ttl + run_key_margin`.
    pub fn new(
        store: SharedStore,
        job: &str,
        tick: DateTime<Utc>,
        tick_ttl: Duration,
        options: TickGuardOptions,
    ) -> Self {
        let claims = vec![
            LeaseClaim::tick(tick_key(job, tick), tick_ttl),
            LeaseClaim::run(run_key(job), tick_ttl + options.run_key_margin),
        ];
        let lease_options = options.lease.with_auto_renew(options.auto_renew);
        Self {
            job: job.to_owned(),
            tick,
            tick_ttl,
            lease: DistributedLease::with_claims(store, claims, lease_options),
        }
    }

    /// Claim the tick key, then the run key.
    ///
    /// # Errors
    ///
    /// [`LockError::AcquisitionFailed`] when the tick was already claimed,
    /// [`LockError::TaskStillRunning`] when a previous run still holds the run key.
    pub async fn acquire(&self) -> Result<(), LockError> {
        self.lease.acquire().await?;
        info!("job {} claimed tick {}", self.job, tick_bucket(self.tick));
        Ok(())
    }

    /// Clear the run key. The tick key expires on its own.
    ///
    /// # Errors
    ///
    /// [`LockError::ReleaseFailed`] when the run key is no longer ours.
    pub async fn release(&self) -> Result<(), LockError> {
        self.lease.release().await
    }

    /// Token written to both keys.
    pub fn token(&self) -> &str {
        self.lease.token()
    }

    /// Job name.
    pub fn job(&self) -> &str {
        &self.job
    }

    /// Tick this guard covers.
    pub const fn tick(&self) -> DateTime<Utc> {
        self.tick
    }

    /// TTL of the tick key.
    pub const fn tick_ttl(&self) -> Duration {
        self.tick_ttl
    }

    /// Underlying lease.
    pub const fn lease(&self) -> &DistributedLease {
        &self.lease
    }
}

/// Idempotent marker for an entry's very first fire.
///
/// Several instances booting together all see "no previous fire". The fence
/// records the tick it was set for. The instance whose set-if-absent on
/// [`fence_key`] succeeds may run; a racer on the same tick gets
/// [`LockError::FencingDenied`] after [`FENCE_ATTEMPTS`] tries. A fence left
/// by a different tick does not block, otherwise a late joiner could strand
/// a tick that no instance runs.
///
/// # Errors
///
/// [`LockError::FencingDenied`] when every attempt found the fence set for `tick`.
pub async fn first_run_fence(
    store: &SharedStore,
    job: &str,
    tick: DateTime<Utc>,
    ttl: Duration,
) -> Result<(), LockError> {
    let key = fence_key(job);
    let bucket = tick_bucket(tick);
    for attempt in 1..=FENCE_ATTEMPTS {
        match store.set_if_absent(&key, &bucket, ttl).await {
            Ok(true) => {
                debug!("first-run fence {} set for {} on attempt {}", key, bucket, attempt);
                return Ok(());
            }
            Ok(false) => match store.get(&key).await {
                Ok(Some(set_for)) if set_for != bucket => {
                    debug!("first-run fence {} belongs to tick {}, passing", key, set_for);
                    return Ok(());
                }
                Ok(_) => debug!("first-run fence {} already set, attempt {}", key, attempt),
                Err(e) => debug!("first-run fence {} unreadable on attempt {}: {}", key, attempt, e),
            },
            Err(e) => debug!("first-run fence {} errored on attempt {}: {}", key, attempt, e),
        }
        tokio::time::sleep(FENCE_RETRY_PAUSE).await;
    }
    Err(LockError::FencingDenied { key })
}
