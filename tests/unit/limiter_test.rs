//! Tests for the alert rate limiter

use std::sync::Arc;
use std::thread;

use prometheus_singleton_cron::limiter::{check_limiter, RateLimiter};

#[test]
fn test_first_check_always_allowed() {
    let limiter = RateLimiter::new();
    assert!(limiter.is_empty());
    assert!(limiter.check("cron.cron.alarm:a", 3600));
    assert!(!limiter.check("cron.cron.alarm:a", 3600));
    assert_eq!(limiter.len(), 1);
}

#[test]
fn test_zero_window_never_throttles() {
    let limiter = RateLimiter::new();
    assert!(limiter.check_at("k", 0, 10));
    assert!(limiter.check_at("k", 0, 10));
}

#[test]
fn test_global_limiter_shared() {
    let key = "limiter_test.global.unique";
    assert!(check_limiter(key, 3600));
    assert!(!RateLimiter::global().check(key, 3600));
}

#[test]
fn test_concurrent_checks_allow_once() {
    let limiter = Arc::new(RateLimiter::new());
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.check_at("shared", 60, 1_000))
        })
        .collect();
    let allowed = handles
        .into_iter()
        .map(|h| h.join().unwrap())
        .filter(|allowed| *allowed)
        .count();
    assert_eq!(allowed, 1);
}
