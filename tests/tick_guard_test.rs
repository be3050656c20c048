//! Integration tests for the two-key tick guard and the first-run fence.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use prometheus_singleton_cron::core::{
    fence_key, first_run_fence, run_key, tick_key, LockError, TickGuard, TickGuardOptions,
};
use prometheus_singleton_cron::infra::{InMemoryStore, LeaseStore, SharedStore};
use prometheus_singleton_cron::util::tick_bucket;
use tokio::time::Instant;

// ============================================================================
// Helpers
// ============================================================================

fn tick(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 14, 9, minute, 0).unwrap()
}

fn guard(store: &Arc<InMemoryStore>, job: &str, at: DateTime<Utc>, ttl: Duration) -> TickGuard {
    let store: SharedStore = store.clone();
    TickGuard::new(store, job, at, ttl, TickGuardOptions::default())
}

// ============================================================================
// Tick claims
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_daily_report_tick_claimed_once() {
    let store = Arc::new(InMemoryStore::new());
    let ttl = Duration::from_secs(60);

    let first = guard(&store, "daily-report", tick(0), ttl);
    first.acquire().await.unwrap();
    first.release().await.unwrap();

    // the tick key outlives the release
    let second = guard(&store, "daily-report", tick(0), ttl);
    let err = second.acquire().await.unwrap_err();
    assert_eq!(
        err,
        LockError::AcquisitionFailed {
            key: tick_key("daily-report", tick(0)),
        }
    );

    tokio::time::advance(Duration::from_secs(61)).await;
    let third = guard(&store, "daily-report", tick(0), ttl);
    third.acquire().await.unwrap();
    third.release().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_overrunning_job_reports_still_running() {
    let store = Arc::new(InMemoryStore::new());
    let ttl = Duration::from_secs(60);

    let running = guard(&store, "sync", tick(0), ttl);
    running.acquire().await.unwrap();

    let next = guard(&store, "sync", tick(1), ttl);
    let err = next.acquire().await.unwrap_err();
    assert_eq!(err, LockError::TaskStillRunning { key: run_key("sync") });

    // the tick claim made before the run-key failure stays until it expires
    assert_eq!(
        store.get(&tick_key("sync", tick(1))).await.unwrap().as_deref(),
        Some(next.token())
    );
    // nothing to clear: the tick claim is left to expire
    next.release().await.unwrap();
    assert!(store.get(&tick_key("sync", tick(1))).await.unwrap().is_some());

    running.release().await.unwrap();
    assert!(store.get(&run_key("sync")).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_only_run_key_is_renewed() {
    let store = Arc::new(InMemoryStore::new());
    let g = guard(&store, "report", tick(0), Duration::from_secs(10));
    g.acquire().await.unwrap();

    // run key ttl 13s renews every 6.5s to two thirds of 13s
    tokio::time::sleep(Duration::from_secs(7)).await;
    let run_left = store.remaining_ttl(&run_key("report")).unwrap();
    let tick_left = store.remaining_ttl(&tick_key("report", tick(0))).unwrap();
    assert!(run_left > Duration::from_secs(8), "run key left {run_left:?}");
    assert!(tick_left <= Duration::from_secs(3), "tick key left {tick_left:?}");

    g.release().await.unwrap();
}

#[tokio::test]
async fn test_run_key_margin_applied() {
    let store = Arc::new(InMemoryStore::new());
    let shared: SharedStore = store.clone();
    let options = TickGuardOptions {
        run_key_margin: Duration::from_secs(30),
        auto_renew: false,
        ..TickGuardOptions::default()
    };
    let g = TickGuard::new(shared, "etl", tick(5), Duration::from_secs(60), options);
    g.acquire().await.unwrap();

    let run_left = store.remaining_ttl(&run_key("etl")).unwrap();
    assert!(run_left > Duration::from_secs(60));
    assert!(run_left <= Duration::from_secs(90));
    assert_eq!(g.tick(), tick(5));
    assert_eq!(g.job(), "etl");
}

// ============================================================================
// First-run fencing
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_first_run_fence_single_winner() {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    let started = Instant::now();

    let (a, b) = tokio::join!(
        first_run_fence(&store, "daily-report", tick(0), Duration::from_secs(60)),
        first_run_fence(&store, "daily-report", tick(0), Duration::from_secs(60)),
    );

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let denied = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert_eq!(
        denied,
        &LockError::FencingDenied {
            key: fence_key("daily-report"),
        }
    );
    // two attempts, each followed by a 100ms pause
    assert_eq!(started.elapsed(), Duration::from_millis(200));
}

#[tokio::test(start_paused = true)]
async fn test_fence_available_again_after_ttl() {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    first_run_fence(&store, "job", tick(0), Duration::from_secs(5)).await.unwrap();
    assert!(first_run_fence(&store, "job", tick(0), Duration::from_secs(5)).await.is_err());

    tokio::time::advance(Duration::from_secs(6)).await;
    first_run_fence(&store, "job", tick(0), Duration::from_secs(5)).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_fence_from_another_tick_does_not_block() {
    let store: SharedStore = Arc::new(InMemoryStore::new());
    first_run_fence(&store, "rollup", tick(0), Duration::from_secs(60)).await.unwrap();

    let started = Instant::now();
    first_run_fence(&store, "rollup", tick(1), Duration::from_secs(60)).await.unwrap();
    assert_eq!(started.elapsed(), Duration::ZERO);
    // the original fence is left in place
    assert_eq!(
        store.get(&fence_key("rollup")).await.unwrap(),
        Some(tick_bucket(tick(0)))
    );
}
