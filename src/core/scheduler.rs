//! Scheduler entries and the per-tick orchestration.
//!
//! Every instance runs the same [`Scheduler`] with the same entries. For each
//! tick an entry:
//!
//! 1. samples local load and asks the ranked set for the best candidate,
//!    sleeping a short backoff when it is not the best;
//! 2. claims the [`TickGuard`] for the tick;
//! 3. on its very first fire, passes the first-run fence;
//! 4. runs the job;
//! 5. releases the guard.
//!
//! Denials at step 2 or 3 skip the tick. Only a still-running previous run
//! and a failed release raise alerts, and only in production.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::CronConfig;
use crate::core::lease::LeaseOptions;
use crate::core::load::{backoff_delay, BestCandidateSelector, LoadReporter};
use crate::core::tick_guard::{first_run_fence, TickGuard, TickGuardOptions};
use crate::core::{LockError, SchedulerError, StoreError};
use crate::infra::alert::AlertDispatcher;
use crate::infra::sampler::LoadSampler;
use crate::infra::schedule::Schedule;
use crate::infra::store::SharedStore;
use crate::util::gap_ttl;

/// Identifier assigned to an entry when it is added.
pub type EntryId = u64;

/// Body of a scheduled job.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Run once.
    async fn run(&self);
}

#[async_trait]
impl<F, Fut> Job for F
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn run(&self) {
        self().await;
    }
}

/// Where an entry is in its tick state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Waiting for the next tick.
    Idle,
    /// Sampling load and querying the best candidate.
    SelectingCandidate,
    /// Sleeping before the claim because another instance is less loaded.
    Backoff,
    /// Claiming the tick guard.
    AcquiringGuard,
    /// Setting the first-run fence.
    FirstRunFencing,
    /// Running the job body.
    Executing,
    /// Releasing the tick guard.
    ReleasingLease,
}

/// How one tick ended on this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The job ran and the guard was released.
    Completed,
    /// The job panicked; the guard was still released.
    JobPanicked,
    /// The job ran but the guard could not be released.
    ReleaseFailed(LockError),
    /// The guard was not acquired; the job did not run.
    GuardDenied(LockError),
    /// Another instance won the first-run fence; the job did not run.
    FencingDenied,
}

impl TickOutcome {
    /// True when this instance ran the job body.
    pub const fn executed(&self) -> bool {
        matches!(self, Self::Completed | Self::JobPanicked | Self::ReleaseFailed(_))
    }
}

/// Point-in-time view of an entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySnapshot {
    /// Entry id.
    pub id: EntryId,
    /// Job name.
    pub name: String,
    /// Last tick this instance fired.
    pub prev: Option<DateTime<Utc>>,
    /// Next tick the loop is waiting for.
    pub next: Option<DateTime<Utc>>,
    /// Current state.
    pub status: EntryStatus,
    /// Token of the guard held right now, if any.
    pub lease_token: Option<String>,
}

struct EntryState {
    prev: Option<DateTime<Utc>>,
    next: Option<DateTime<Utc>>,
    status: EntryStatus,
    current_lease: Option<Arc<TickGuard>>,
    loop_cancel: Option<CancellationToken>,
}

/// One registered job and its schedule.
pub struct SchedulerEntry {
    id: EntryId,
    name: String,
    schedule: Arc<dyn Schedule>,
    job: Arc<dyn Job>,
    state: Mutex<EntryState>,
}

impl SchedulerEntry {
    fn new(id: EntryId, name: String, schedule: Arc<dyn Schedule>, job: Arc<dyn Job>) -> Self {
        Self {
            id,
            name,
            schedule,
            job,
            state: Mutex::new(EntryState {
                prev: None,
                next: None,
                status: EntryStatus::Idle,
                current_lease: None,
                loop_cancel: None,
            }),
        }
    }

    /// Entry id.
    pub const fn id(&self) -> EntryId {
        self.id
    }

    /// Job name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    pub fn snapshot(&self) -> EntrySnapshot {
        let state = self.state.lock();
        EntrySnapshot {
            id: self.id,
            name: self.name.clone(),
            prev: state.prev,
            next: state.next,
            status: state.status,
            lease_token: state.current_lease.as_ref().map(|g| g.token().to_owned()),
        }
    }

    /// Record `tick` as fired. Returns true if it is the entry's first fire.
    fn begin_tick(&self, tick: DateTime<Utc>) -> bool {
        let mut state = self.state.lock();
        let first = state.prev.is_none();
        state.prev = Some(tick);
        state.status = EntryStatus::SelectingCandidate;
        first
    }

    fn set_status(&self, status: EntryStatus) {
        self.state.lock().status = status;
    }

    fn hold(&self, guard: Arc<TickGuard>) {
        self.state.lock().current_lease = Some(guard);
    }

    /// Drop `guard` if it is the one held and go back to waiting.
    fn settle(&self, guard: &Arc<TickGuard>) {
        let mut state = self.state.lock();
        if state.current_lease.as_ref().is_some_and(|g| Arc::ptr_eq(g, guard)) {
            state.current_lease = None;
        }
        state.status = Self::resting_status(&state);
    }

    /// A denied tick must not disturb an overrunning one.
    fn settle_denied(&self) {
        let mut state = self.state.lock();
        state.status = Self::resting_status(&state);
    }

    fn resting_status(state: &EntryState) -> EntryStatus {
        if state.current_lease.is_some() {
            EntryStatus::Executing
        } else {
            EntryStatus::Idle
        }
    }

    /// Advance `next` from `max(now, previous next)` and return it.
    fn advance(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut state = self.state.lock();
        let base = state.next.map_or(now, |next| next.max(now));
        let next = self.schedule.next(base);
        state.next = Some(next);
        next
    }

    fn stop_loop(&self) {
        if let Some(cancel) = self.state.lock().loop_cancel.take() {
            cancel.cancel();
        }
    }
}

impl std::fmt::Debug for SchedulerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerEntry")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Collaborators a scheduler is built from.
pub struct SchedulerParts {
    /// Validated configuration.
    pub config: CronConfig,
    /// Shared store.
    pub store: SharedStore,
    /// Local load source.
    pub sampler: Arc<dyn LoadSampler>,
    /// Alert front.
    pub alerts: AlertDispatcher,
}

struct SchedulerInner {
    config: CronConfig,
    store: SharedStore,
    sampler: Arc<dyn LoadSampler>,
    reporter: LoadReporter,
    selector: BestCandidateSelector,
    alerts: AlertDispatcher,
    entries: RwLock<Vec<Arc<SchedulerEntry>>>,
    next_id: AtomicU64,
    running: Mutex<Option<CancellationToken>>,
    tracker: TaskTracker,
}

/// Cron scheduler coordinating ticks with every other instance through the
/// shared store.
///
/// # Example
///
/// ```rust,ignore
/// use std::sync::Arc;
/// use std::time::Duration;
/// use prometheus_singleton_cron::builders::SchedulerBuilder;
/// use prometheus_singleton_cron::infra::{EverySchedule, InMemoryStore};
///
/// let scheduler = SchedulerBuilder::new()
///     .store(Arc::new(InMemoryStore::new()))
///     .build()?;
/// scheduler.add("sync-users", EverySchedule::new(Duration::from_secs(60)), || async {
///     sync_users().await;
/// })?;
/// scheduler.start();
/// ```
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    /// Assemble a scheduler from its parts.
    pub fn from_parts(parts: SchedulerParts) -> Self {
        let set_key = parts.config.load.ranked_set_key.clone();
        Self {
            inner: Arc::new(SchedulerInner {
                reporter: LoadReporter::new(Arc::clone(&parts.store), set_key.clone()),
                selector: BestCandidateSelector::new(Arc::clone(&parts.store), set_key),
                config: parts.config,
                store: parts.store,
                sampler: parts.sampler,
                alerts: parts.alerts,
                entries: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                running: Mutex::new(None),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Configuration in use.
    pub fn config(&self) -> &CronConfig {
        &self.inner.config
    }

    /// Register a job. Names are unique within a scheduler.
    ///
    /// When the scheduler is running the entry's loop starts immediately.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::DuplicateEntry`] if the name is taken.
    pub fn add<S, J>(&self, name: &str, schedule: S, job: J) -> Result<EntryId, SchedulerError>
    where
        S: Schedule,
        J: Job,
    {
        let entry = {
            let mut entries = self.inner.entries.write();
            if entries.iter().any(|e| e.name == name) {
                return Err(SchedulerError::DuplicateEntry(name.to_owned()));
            }
            let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
            let entry = Arc::new(SchedulerEntry::new(
                id,
                name.to_owned(),
                Arc::new(schedule),
                Arc::new(job),
            ));
            entries.push(Arc::clone(&entry));
            entry
        };
        info!(job = %name, id = entry.id, "entry added");

        let running = self.inner.running.lock().clone();
        if let Some(cancel) = running {
            self.spawn_loop(&entry, &cancel);
        }
        Ok(entry.id)
    }

    /// Remove an entry by id and stop its loop. Runs in flight finish.
    pub fn remove(&self, id: EntryId) -> bool {
        self.remove_where(|e| e.id == id)
    }

    /// Remove an entry by name and stop its loop.
    pub fn remove_by_name(&self, name: &str) -> bool {
        self.remove_where(|e| e.name == name)
    }

    fn remove_where(&self, pred: impl Fn(&Arc<SchedulerEntry>) -> bool) -> bool {
        let removed = {
            let mut entries = self.inner.entries.write();
            let idx = entries.iter().position(pred);
            idx.map(|idx| entries.remove(idx))
        };
        match removed {
            Some(entry) => {
                entry.stop_loop();
                info!(job = %entry.name, id = entry.id, "entry removed");
                true
            }
            None => false,
        }
    }

    /// Snapshots of every entry, in registration order.
    pub fn entries(&self) -> Vec<EntrySnapshot> {
        self.inner.entries.read().iter().map(|e| e.snapshot()).collect()
    }

    /// True between [`start`](Self::start) and [`stop`](Self::stop).
    pub fn is_running(&self) -> bool {
        self.inner.running.lock().is_some()
    }

    /// Start one tick loop per entry plus the periodic load reporter.
    /// Does nothing when already running.
    pub fn start(&self) {
        let cancel = {
            let mut running = self.inner.running.lock();
            if running.is_some() {
                return;
            }
            let cancel = CancellationToken::new();
            *running = Some(cancel.clone());
            cancel
        };

        let entries: Vec<_> = self.inner.entries.read().iter().cloned().collect();
        for entry in &entries {
            self.spawn_loop(entry, &cancel);
        }
        self.spawn_reporter(&cancel);
        info!(entries = entries.len(), "scheduler started");
    }

    /// Stop every loop and wait for runs in flight to finish.
    pub async fn stop(&self) {
        let Some(cancel) = self.inner.running.lock().take() else {
            return;
        };
        cancel.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.tracker.reopen();
        info!("scheduler stopped");
    }

    /// Run one tick of `name` right now.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::UnknownEntry`] if no entry has that name.
    pub async fn fire(&self, name: &str, tick: DateTime<Utc>) -> Result<TickOutcome, SchedulerError> {
        let entry = self
            .inner
            .entries
            .read()
            .iter()
            .find(|e| e.name == name)
            .cloned()
            .ok_or_else(|| SchedulerError::UnknownEntry(name.to_owned()))?;
        Ok(self.inner.fire_entry(&entry, tick).await)
    }

    /// Sample local load and publish it to the ranked set.
    ///
    /// # Errors
    ///
    /// Returns the store error if publishing fails.
    pub async fn report_load(&self) -> Result<(), StoreError> {
        self.inner.report_load().await
    }

    fn spawn_loop(&self, entry: &Arc<SchedulerEntry>, parent: &CancellationToken) {
        let cancel = parent.child_token();
        if let Some(old) = entry.state.lock().loop_cancel.replace(cancel.clone()) {
            old.cancel();
        }
        let inner = Arc::clone(&self.inner);
        let entry = Arc::clone(entry);
        self.inner.tracker.spawn(async move {
            inner.run_loop(entry, cancel).await;
        });
    }

    fn spawn_reporter(&self, cancel: &CancellationToken) {
        let interval_secs = self.inner.config.load.report_interval_secs;
        if interval_secs == 0 {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let cancel = cancel.clone();
        self.inner.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = inner.report_load().await {
                            warn!("load report failed: {}", e);
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("entries", &self.inner.entries.read().len())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl SchedulerInner {
    async fn run_loop(self: Arc<Self>, entry: Arc<SchedulerEntry>, cancel: CancellationToken) {
        debug!(job = %entry.name, "tick loop started");
        loop {
            let next = entry.advance(Utc::now());
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(wait) => {}
            }
            let inner = Arc::clone(&self);
            let tick_entry = Arc::clone(&entry);
            self.tracker.spawn(async move {
                inner.fire_entry(&tick_entry, next).await;
            });
        }
        debug!(job = %entry.name, "tick loop stopped");
    }

    async fn report_load(&self) -> Result<(), StoreError> {
        let sample = self.sampler.sample().await;
        self.reporter.report(&sample).await
    }

    fn guard_options(&self) -> TickGuardOptions {
        TickGuardOptions {
            run_key_margin: self.config.lease.run_key_margin(),
            auto_renew: self.config.lease.auto_renew,
            lease: LeaseOptions::new().with_retry_interval(self.config.lease.spin_retry()),
        }
    }

    /// Sleep a load-proportional backoff unless this instance is the best
    /// candidate or no instance reported today.
    async fn backoff_if_not_best(&self, entry: &SchedulerEntry) {
        let sample = self.sampler.sample().await;
        let best = match self.selector.best().await {
            Ok(best) => best,
            Err(e) => {
                warn!(job = %entry.name, "best candidate lookup failed: {}", e);
                None
            }
        };
        let Some(best) = best else {
            return;
        };
        if best == sample.ip {
            return;
        }
        let delay = backoff_delay(&sample);
        debug!(job = %entry.name, best = %best, "not the best candidate, backing off {:?}", delay);
        entry.set_status(EntryStatus::Backoff);
        tokio::time::sleep(delay).await;
    }

    async fn fire_entry(&self, entry: &SchedulerEntry, tick: DateTime<Utc>) -> TickOutcome {
        let first = entry.begin_tick(tick);
        let ttl = gap_ttl(tick, entry.schedule.next(tick));

        self.backoff_if_not_best(entry).await;

        entry.set_status(EntryStatus::AcquiringGuard);
        let guard = Arc::new(TickGuard::new(
            Arc::clone(&self.store),
            &entry.name,
            tick,
            ttl,
            self.guard_options(),
        ));
        if let Err(e) = guard.acquire().await {
            match &e {
                LockError::TaskStillRunning { .. } => {
                    warn!(job = %entry.name, "previous run still in flight");
                    self.alert_still_running(&entry.name).await;
                }
                other if other.is_contention() => debug!(job = %entry.name, "tick not claimed: {}", other),
                other => warn!(job = %entry.name, "tick claim failed: {}", other),
            }
            entry.settle_denied();
            return TickOutcome::GuardDenied(e);
        }
        entry.hold(Arc::clone(&guard));

        if first {
            entry.set_status(EntryStatus::FirstRunFencing);
            if let Err(e) = first_run_fence(&self.store, &entry.name, tick, ttl).await {
                debug!(job = %entry.name, "{}", e);
                if let Err(e) = guard.release().await {
                    warn!(job = %entry.name, "release after fencing denial failed: {}", e);
                }
                entry.settle(&guard);
                return TickOutcome::FencingDenied;
            }
        }

        entry.set_status(EntryStatus::Executing);
        info!(job = %entry.name, token = %guard.token(), "executing tick");
        let panicked = AssertUnwindSafe(entry.job.run()).catch_unwind().await.is_err();
        if panicked {
            error!(job = %entry.name, "job panicked");
        }

        entry.set_status(EntryStatus::ReleasingLease);
        let released = guard.release().await;
        entry.settle(&guard);
        match released {
            Ok(()) if panicked => TickOutcome::JobPanicked,
            Ok(()) => TickOutcome::Completed,
            Err(e) => {
                self.alert_release_failed(&entry.name, &e).await;
                TickOutcome::ReleaseFailed(e)
            }
        }
    }

    async fn alert_still_running(&self, job: &str) {
        if !self.config.is_production() {
            return;
        }
        let content = format!("cron job {job} is still running past its next tick, please check");
        let key = format!("{}.cron.alarm:{job}", self.config.alert.key_prefix);
        self.alerts.alert(&content, Some(&key)).await;
    }

    async fn alert_release_failed(&self, job: &str, err: &LockError) {
        if !self.config.is_production() {
            return;
        }
        let content = format!("cron job {job} could not release its lease: {err}");
        let key = format!("{}.lease.alarm", self.config.alert.key_prefix);
        self.alerts.alert(&content, Some(&key)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::alert::LogAlerter;
    use crate::infra::sampler::FixedSampler;
    use crate::infra::schedule::EverySchedule;
    use crate::infra::store::InMemoryStore;
    use chrono::TimeZone;
    use std::time::Duration;

    fn scheduler() -> Scheduler {
        Scheduler::from_parts(SchedulerParts {
            config: CronConfig::default(),
            store: Arc::new(InMemoryStore::new()),
            sampler: Arc::new(FixedSampler::new("10.0.0.1", 0.0, 0.0)),
            alerts: AlertDispatcher::new(Arc::new(LogAlerter), 3600),
        })
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let s = scheduler();
        let every = EverySchedule::new(Duration::from_secs(60));
        s.add("a", every, || async {}).unwrap();
        let err = s.add("a", every, || async {}).unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateEntry(name) if name == "a"));
    }

    #[test]
    fn test_remove_by_id_and_name() {
        let s = scheduler();
        let every = EverySchedule::new(Duration::from_secs(60));
        let a = s.add("a", every, || async {}).unwrap();
        s.add("b", every, || async {}).unwrap();

        assert!(s.remove(a));
        assert!(!s.remove(a));
        assert!(s.remove_by_name("b"));
        assert!(s.entries().is_empty());
    }

    #[test]
    fn test_advance_never_goes_backwards() {
        let entry = SchedulerEntry::new(
            1,
            "a".into(),
            Arc::new(EverySchedule::new(Duration::from_secs(60))),
            Arc::new(|| async {}),
        );
        let t = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 0).unwrap();
        let first = entry.advance(t);
        assert_eq!(first, t + chrono::Duration::seconds(60));
        // clock stepped back: next still moves forward from the previous next
        let second = entry.advance(t - chrono::Duration::seconds(30));
        assert_eq!(second, t + chrono::Duration::seconds(120));
    }

    #[tokio::test]
    async fn test_fire_unknown_entry() {
        let s = scheduler();
        let err = s.fire("missing", Utc::now()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::UnknownEntry(_)));
    }
}
