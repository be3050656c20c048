//! Token-owned leases in the shared store.
//!
//! A [`DistributedLease`] claims one or more keys with the same token. Each
//! key is a [`LeaseClaim`] whose [`ClaimRole`] decides how a failed claim is
//! classified and whether release clears it. A single-key lock is just a lease
//! with one [`ClaimRole::Exclusive`] claim.
//!
//! # Concurrency
//!
//! - Store-touching operations on one lease are serialized by an async mutex.
//! - Auto-renewal runs as its own task, ticking at half the shortest renewable
//!   TTL and refreshing to two thirds of each claim's TTL.
//! - Release cancels and joins the renewal task before touching the store, so
//!   no renewal starts after release begins.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::{LockError, StoreError};
use crate::infra::store::SharedStore;

/// Default TTL for single-key leases.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(5);

/// Fixed cadence between spin-acquire attempts.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// What a claimed key means, which drives failure classification and release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimRole {
    /// Plain mutual exclusion; failure is ordinary contention.
    Exclusive,
    /// Claim on one scheduled tick. Kept until it expires so a finished tick
    /// cannot be claimed again by a late instance.
    Tick,
    /// Claim on a job's execution. Failure means a previous run still holds it.
    Run,
}

/// One key a lease must claim.
#[derive(Debug, Clone)]
pub struct LeaseClaim {
    /// Store key.
    pub key: String,
    /// TTL set on successful claim.
    pub ttl: Duration,
    /// How the claim is classified.
    pub role: ClaimRole,
    /// Whether auto-renewal and [`DistributedLease::renew`] refresh this key.
    pub renewable: bool,
}

impl LeaseClaim {
    /// Renewable exclusive claim.
    pub fn exclusive(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            role: ClaimRole::Exclusive,
            renewable: true,
        }
    }

    /// Non-renewable tick claim.
    pub fn tick(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            role: ClaimRole::Tick,
            renewable: false,
        }
    }

    /// Renewable run claim.
    pub fn run(key: impl Into<String>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            ttl,
            role: ClaimRole::Run,
            renewable: true,
        }
    }

    const fn cleared_on_release(&self) -> bool {
        !matches!(self.role, ClaimRole::Tick)
    }

    fn denied(&self) -> LockError {
        match self.role {
            ClaimRole::Run => LockError::TaskStillRunning {
                key: self.key.clone(),
            },
            ClaimRole::Exclusive | ClaimRole::Tick => LockError::AcquisitionFailed {
                key: self.key.clone(),
            },
        }
    }

    /// TTL applied on renewal.
    fn renewal_ttl(&self) -> Duration {
        self.ttl * 2 / 3
    }
}

/// Construction options for a lease.
#[derive(Debug, Clone)]
pub struct LeaseOptions {
    /// TTL for [`DistributedLease::new`] single-key leases.
    pub ttl: Duration,
    /// Start a renewal task after each successful acquire.
    pub auto_renew: bool,
    /// Explicit token; a fresh one is generated when `None`.
    pub token: Option<String>,
    /// Pause between spin-acquire attempts.
    pub retry_interval: Duration,
    /// External cancellation observed by spin-acquire and auto-renewal.
    pub cancel: CancellationToken,
}

impl Default for LeaseOptions {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_LEASE_TTL,
            auto_renew: false,
            token: None,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }
}

impl LeaseOptions {
    /// Options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the single-key TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Enable or disable auto-renewal.
    #[must_use]
    pub fn with_auto_renew(mut self, auto_renew: bool) -> Self {
        self.auto_renew = auto_renew;
        self
    }

    /// Use a caller-chosen token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the spin-acquire cadence.
    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// Observe an external cancellation signal.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Generate a token unique to one lease object.
pub fn new_token() -> String {
    format!("token_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug)]
struct LeaseState {
    held: Vec<bool>,
    held_since: Option<DateTime<Utc>>,
}

struct LeaseInner {
    store: SharedStore,
    token: String,
    claims: Vec<LeaseClaim>,
    retry_interval: Duration,
    auto_renew: bool,
    cancel: CancellationToken,
    state: tokio::sync::Mutex<LeaseState>,
}

impl LeaseInner {
    async fn acquire(&self) -> Result<(), LockError> {
        let mut state = self.state.lock().await;
        for (idx, claim) in self.claims.iter().enumerate() {
            // left over from an earlier partial attempt
            if state.held[idx] {
                if self.store.get(&claim.key).await?.as_deref() == Some(self.token.as_str()) {
                    continue;
                }
                state.held[idx] = false;
            }
            match self.store.set_if_absent(&claim.key, &self.token, claim.ttl).await {
                Ok(true) => state.held[idx] = true,
                Ok(false) => {
                    debug!("claim on {} denied for {}", claim.key, self.token);
                    return Err(claim.denied());
                }
                Err(e) => {
                    warn!("claim on {} failed: {}", claim.key, e);
                    return Err(e.into());
                }
            }
        }
        state.held_since = Some(Utc::now());
        Ok(())
    }

    async fn renew(&self) -> Result<(), LockError> {
        let state = self.state.lock().await;
        let mut renewed = false;
        for (idx, claim) in self.claims.iter().enumerate() {
            if !claim.renewable || !state.held[idx] {
                continue;
            }
            let ttl = claim.renewal_ttl();
            if !self.store.compare_and_expire(&claim.key, &self.token, ttl).await? {
                return Err(LockError::RenewalFailed(format!(
                    "{} is no longer held by {}",
                    claim.key, self.token
                )));
            }
            renewed = true;
        }
        if renewed {
            debug!("renewed lease {}", self.token);
            Ok(())
        } else {
            Err(LockError::RenewalFailed(format!("{} holds no renewable key", self.token)))
        }
    }

    async fn release(&self) -> Result<(), LockError> {
        let mut state = self.state.lock().await;
        if !state.held.iter().any(|held| *held) {
            return Err(LockError::ReleaseFailed(format!("{} holds no key", self.token)));
        }

        let mut mismatched = Vec::new();
        let mut store_error: Option<StoreError> = None;
        for (idx, claim) in self.claims.iter().enumerate() {
            if !state.held[idx] {
                continue;
            }
            state.held[idx] = false;
            if !claim.cleared_on_release() {
                continue;
            }
            match self.store.compare_and_delete(&claim.key, &self.token).await {
                Ok(true) => {}
                Ok(false) => mismatched.push(claim.key.clone()),
                Err(e) => store_error = Some(e),
            }
        }
        state.held_since = None;

        if let Some(e) = store_error {
            return Err(e.into());
        }
        if mismatched.is_empty() {
            Ok(())
        } else {
            Err(LockError::ReleaseFailed(format!(
                "ownership mismatch on {} for {}",
                mismatched.join(","),
                self.token
            )))
        }
    }

    fn renew_period(&self) -> Option<Duration> {
        self.claims
            .iter()
            .filter(|c| c.renewable)
            .map(|c| c.ttl / 2)
            .min()
            .filter(|period| !period.is_zero())
    }
}

/// Handle to a running auto-renewal task.
struct Renewer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A lease over one or more keys in the shared store, owned by a unique token.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use std::time::Duration;
/// use prometheus_singleton_cron::core::{DistributedLease, LeaseOptions};
/// use prometheus_singleton_cron::infra::store::InMemoryStore;
///
/// let store = Arc::new(InMemoryStore::new());
/// let lease = DistributedLease::new(store, "reindex", LeaseOptions::new().with_auto_renew(true));
/// lease.spin_acquire(Duration::from_secs(2)).await?;
/// // ... exclusive work ...
/// lease.release().await?;
/// ```
pub struct DistributedLease {
    inner: Arc<LeaseInner>,
    renewer: Mutex<Option<Renewer>>,
}

impl DistributedLease {
    /// Single-key lease using `options.ttl`.
    pub fn new(store: SharedStore, key: impl Into<String>, options: LeaseOptions) -> Self {
        let claim = LeaseClaim::exclusive(key, options.ttl);
        Self::with_claims(store, vec![claim], options)
    }

    /// Lease that must claim every key in `claims`, in order, with one token.
    pub fn with_claims(store: SharedStore, claims: Vec<LeaseClaim>, options: LeaseOptions) -> Self {
        let token = options.token.unwrap_or_else(new_token);
        let held = vec![false; claims.len()];
        Self {
            inner: Arc::new(LeaseInner {
                store,
                token,
                claims,
                retry_interval: options.retry_interval,
                auto_renew: options.auto_renew,
                cancel: options.cancel,
                state: tokio::sync::Mutex::new(LeaseState {
                    held,
                    held_since: None,
                }),
            }),
            renewer: Mutex::new(None),
        }
    }

    /// Token written to every claimed key.
    pub fn token(&self) -> &str {
        &self.inner.token
    }

    /// Claims in acquisition order.
    pub fn claims(&self) -> &[LeaseClaim] {
        &self.inner.claims
    }

    /// When the last successful acquire completed, if still held.
    pub async fn held_since(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().await.held_since
    }

    /// True when every claim is currently held by this lease.
    pub async fn is_held(&self) -> bool {
        self.inner.state.lock().await.held.iter().all(|held| *held)
    }

    /// Claim every key with set-if-absent.
    ///
    /// Stops at the first denied claim. Keys claimed before it stay claimed
    /// and expire on their own unless [`release`](Self::release) is called.
    ///
    /// # Errors
    ///
    /// [`LockError::AcquisitionFailed`] or [`LockError::TaskStillRunning`]
    /// depending on the denied claim's role, or [`LockError::Store`].
    pub async fn acquire(&self) -> Result<(), LockError> {
        self.inner.acquire().await?;
        info!("lease {} acquired", self.inner.token);
        if self.inner.auto_renew {
            self.start_renewal();
        }
        Ok(())
    }

    /// Retry [`acquire`](Self::acquire) at the fixed retry cadence.
    ///
    /// # Errors
    ///
    /// [`LockError::SpinLockTimeout`] once `timeout` has elapsed, or
    /// [`LockError::Cancelled`] when the external signal fires first.
    pub async fn spin_acquire(&self, timeout: Duration) -> Result<(), LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if Instant::now() >= deadline {
                return Err(LockError::SpinLockTimeout(timeout));
            }
            match self.acquire().await {
                Ok(()) => return Ok(()),
                Err(e) => debug!("spin attempt for {} failed: {}", self.inner.token, e),
            }
            tokio::select! {
                () = self.inner.cancel.cancelled() => return Err(LockError::Cancelled),
                () = tokio::time::sleep(self.inner.retry_interval) => {}
            }
        }
    }

    /// Refresh every held renewable claim to two thirds of its TTL.
    ///
    /// # Errors
    ///
    /// [`LockError::RenewalFailed`] when a claim is no longer held by this token.
    pub async fn renew(&self) -> Result<(), LockError> {
        self.inner.renew().await
    }

    /// Stop auto-renewal, then clear every claimed key this lease still owns.
    ///
    /// Tick claims are left to expire.
    ///
    /// # Errors
    ///
    /// [`LockError::ReleaseFailed`] when nothing is held or a key was taken
    /// over by another token; that key is left untouched.
    pub async fn release(&self) -> Result<(), LockError> {
        self.stop_renewal().await;
        let result = self.inner.release().await;
        match &result {
            Ok(()) => info!("lease {} released", self.inner.token),
            Err(e) => warn!("lease {} release failed: {}", self.inner.token, e),
        }
        result
    }

    fn start_renewal(&self) {
        let Some(period) = self.inner.renew_period() else {
            return;
        };
        let mut slot = self.renewer.lock();
        if slot.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return;
        }

        let cancel = self.inner.cancel.child_token();
        let task_cancel = cancel.clone();
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => {
                        debug!("auto-renew for {} stopped", inner.token);
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = inner.renew().await {
                            warn!("auto-renew for {} failed: {}", inner.token, e);
                            return;
                        }
                    }
                }
            }
        });
        *slot = Some(Renewer { cancel, handle });
    }

    async fn stop_renewal(&self) {
        let renewer = self.renewer.lock().take();
        if let Some(renewer) = renewer {
            renewer.cancel.cancel();
            if let Err(e) = renewer.handle.await {
                warn!("auto-renew task for {} ended abnormally: {}", self.inner.token, e);
            }
        }
    }
}

impl Drop for DistributedLease {
    fn drop(&mut self) {
        if let Some(renewer) = self.renewer.get_mut().take() {
            renewer.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for DistributedLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLease")
            .field("token", &self.inner.token)
            .field("claims", &self.inner.claims)
            .finish_non_exhaustive()
    }
}
