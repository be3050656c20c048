//! Tests for utility helpers

use std::time::Duration;

use chrono::{NaiveDate, TimeZone, Utc};
use prometheus_singleton_cron::util::{date_bucket, gap_ttl, tick_bucket, unix_secs, MAX_TICK_TTL};

#[test]
fn test_unix_secs_tracks_system_clock() {
    let system = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let secs = unix_secs();
    assert!((secs - i64::try_from(system).unwrap()).abs() <= 1);
}

#[test]
fn test_buckets() {
    let tick = Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap();
    assert_eq!(tick_bucket(tick), "20261231235959");
    assert_eq!(date_bucket(NaiveDate::from_ymd_opt(2026, 12, 31).unwrap()), 20_261_231);
}

#[test]
fn test_gap_ttl_caps_at_one_day() {
    let tick = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
    let ttl = gap_ttl(tick, tick + chrono::Duration::hours(25));
    assert_eq!(ttl, MAX_TICK_TTL);
    assert_eq!(ttl, Duration::from_secs(86_400));
}
