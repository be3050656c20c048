//! Wall-clock helpers and the time buckets used in store keys.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};

/// Longest TTL a tick claim may carry.
pub const MAX_TICK_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Whole seconds since the Unix epoch.
pub fn unix_secs() -> i64 {
    Utc::now().timestamp()
}

/// Second-resolution bucket appended to tick keys, e.g. `20260314093000`.
pub fn tick_bucket(tick: DateTime<Utc>) -> String {
    tick.format("%Y%m%d%H%M%S").to_string()
}

/// Calendar-day bucket as a `YYYYMMDD` integer.
pub fn date_bucket(date: NaiveDate) -> u32 {
    // month and day are bounded, and years before 0 never occur here
    let year = u32::try_from(date.year()).unwrap_or_default();
    year * 10_000 + date.month() * 100 + date.day()
}

/// Time from `tick` until `next`, capped at one day and floored at one second.
pub fn gap_ttl(tick: DateTime<Utc>, next: DateTime<Utc>) -> Duration {
    let secs = (next - tick).num_seconds();
    let secs = u64::try_from(secs).unwrap_or_default().max(1);
    Duration::from_secs(secs).min(MAX_TICK_TTL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_tick_bucket_format() {
        let tick = Utc.with_ymd_and_hms(2026, 3, 14, 9, 30, 5).unwrap();
        assert_eq!(tick_bucket(tick), "20260314093005");
    }

    #[test]
    fn test_date_bucket() {
        let date = NaiveDate::from_ymd_opt(2026, 1, 7).unwrap();
        assert_eq!(date_bucket(date), 20_260_107);
    }

    #[test]
    fn test_gap_ttl_bounds() {
        let tick = Utc.with_ymd_and_hms(2026, 3, 14, 0, 0, 0).unwrap();
        assert_eq!(gap_ttl(tick, tick + chrono::Duration::seconds(60)), Duration::from_secs(60));
        assert_eq!(gap_ttl(tick, tick), Duration::from_secs(1));
        assert_eq!(gap_ttl(tick, tick + chrono::Duration::days(7)), MAX_TICK_TTL);
    }
}
