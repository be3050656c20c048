//! Integration tests for single-flight call deduplication.
//!
//! This test validates:
//! 1. Concurrent calls with one key execute the function once
//! 2. Sequential calls never reuse a finished result
//! 3. `forget` lets a new call start while an old one is still running
//! 4. Panics reach both the executor and waiters
//! 5. An aborted executor wakes waiters with an abnormal-exit error

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use prometheus_singleton_cron::single_flight::{FlightError, Group, PanicError};
use tokio::sync::{oneshot, Semaphore};

// ============================================================================
// Helpers
// ============================================================================

/// Stand-in for a job that panics while rendering.
async fn explode(msg: &'static str) -> Result<String, String> {
    panic!("{msg}")
}

/// Wait until `group` has `n` keys in flight.
async fn wait_in_flight(group: &Group<String, String>, n: usize) {
    while group.in_flight() != n {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test]
async fn test_concurrent_calls_execute_once() {
    let group: Group<String, String> = Group::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Semaphore::new(0));

    let first = {
        let group = group.clone();
        let calls = calls.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            group
                .call("user:42", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    let _permit = gate.acquire().await;
                    Ok("profile".to_string())
                })
                .await
        })
    };
    wait_in_flight(&group, 1).await;

    let second = {
        let group = group.clone();
        let calls = calls.clone();
        tokio::spawn(async move {
            group
                .call("user:42", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("other".to_string())
                })
                .await
        })
    };
    // let the duplicate register before the executor finishes
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.add_permits(1);

    let (first_result, first_shared) = first.await.unwrap();
    let (second_result, second_shared) = second.await.unwrap();
    assert_eq!(first_result.unwrap(), "profile");
    assert_eq!(second_result.unwrap(), "profile");
    assert!(first_shared);
    assert!(second_shared);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(group.in_flight(), 0);
}

#[tokio::test]
async fn test_shared_error_reaches_every_caller() {
    let group: Group<String, String> = Group::new();
    let gate = Arc::new(Semaphore::new(0));

    let rx = {
        let gate = gate.clone();
        group.call_chan("k", || async move {
            let _permit = gate.acquire().await;
            Err("backend down".to_string())
        })
    };
    let dup = group.call_chan("k", || async { Ok("unused".to_string()) });
    gate.add_permits(1);

    let a = rx.await;
    let b = dup.await;
    assert!(matches!(a.result, Err(FlightError::Failed(ref e)) if e == "backend down"));
    assert!(matches!(b.result, Err(FlightError::Failed(ref e)) if e == "backend down"));
    assert!(a.shared && b.shared);
}

#[tokio::test]
async fn test_sequential_calls_execute_twice() {
    let group: Group<u64, String> = Group::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for expected in 1..=2 {
        let calls = calls.clone();
        let (result, shared) = group
            .call("k", || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) as u64 + 1) })
            .await;
        assert_eq!(result.unwrap(), expected);
        assert!(!shared);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_forget_starts_fresh_flight() {
    let group: Group<String, String> = Group::new();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    let stale = group.call_chan("config", || async move {
        let _ = release_rx.await;
        Ok("stale".to_string())
    });
    wait_in_flight(&group, 1).await;

    group.forget("config");
    assert_eq!(group.in_flight(), 0);

    let (fresh, shared) = group.call("config", || async { Ok("fresh".to_string()) }).await;
    assert_eq!(fresh.unwrap(), "fresh");
    assert!(!shared);

    release_tx.send(()).unwrap();
    assert_eq!(stale.await.result.unwrap(), "stale");
}

// ============================================================================
// Panics and abnormal exits
// ============================================================================

#[tokio::test]
async fn test_panic_resumes_in_executor() {
    let group: Group<String, String> = Group::new();
    let handle = tokio::spawn(async move {
        group
            .call("k", || explode("render failed"))
            .await
    });
    let err = handle.await.unwrap_err();
    assert!(err.is_panic());
}

#[tokio::test]
async fn test_panic_reaches_duplicate_caller() {
    let group: Group<String, String> = Group::new();
    let gate = Arc::new(Semaphore::new(0));

    let executor = {
        let group = group.clone();
        let gate = gate.clone();
        tokio::spawn(async move {
            group
                .call("k", || async move {
                    let _permit = gate.acquire().await;
                    explode("render failed").await
                })
                .await
        })
    };
    wait_in_flight(&group, 1).await;

    let duplicate = {
        let group = group.clone();
        tokio::spawn(async move { group.call("k", || async { Ok(String::new()) }).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    gate.add_permits(1);

    assert!(executor.await.unwrap_err().is_panic());
    let payload = duplicate.await.unwrap_err().into_panic();
    let panic = payload.downcast::<PanicError>().unwrap();
    assert_eq!(panic.value(), "render failed");
}

#[tokio::test]
async fn test_panic_delivered_to_channel_waiters() {
    let group: Group<String, String> = Group::new();
    let rx = group.call_chan("k", || explode("bad template"));

    let outcome = rx.await;
    match outcome.result {
        Err(FlightError::Panicked(p)) => {
            assert_eq!(p.value(), "bad template");
            assert!(p.to_string().starts_with("bad template\n\n"));
        }
        other => panic!("expected panic, got {other:?}"),
    }
    assert_eq!(group.in_flight(), 0);
}

#[tokio::test]
async fn test_aborted_executor_is_abnormal_exit() {
    let group: Group<String, String> = Group::new();

    let executor = {
        let group = group.clone();
        tokio::spawn(async move {
            group
                .call("k", || async {
                    std::future::pending::<()>().await;
                    Ok(String::new())
                })
                .await
        })
    };
    wait_in_flight(&group, 1).await;

    let waiter = group.call_chan("k", || async { Ok(String::new()) });
    let caller = {
        let group = group.clone();
        tokio::spawn(async move { group.call("k", || async { Ok(String::new()) }).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    executor.abort();
    assert!(executor.await.unwrap_err().is_cancelled());

    let outcome = waiter.await;
    assert!(matches!(outcome.result, Err(FlightError::AbnormalExit)));
    let (result, shared) = caller.await.unwrap();
    assert!(matches!(result, Err(FlightError::AbnormalExit)));
    assert!(shared);
    assert_eq!(group.in_flight(), 0);
}
