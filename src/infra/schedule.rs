//! Fire-time calculation.
//!
//! Cron expression parsing lives outside this crate; anything that can answer
//! "when is the next fire after `t`" plugs in through [`Schedule`].

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

/// Computes the next fire time strictly after a given instant.
pub trait Schedule: Send + Sync + 'static {
    /// Next fire time after `after`.
    fn next(&self, after: DateTime<Utc>) -> DateTime<Utc>;
}

impl<F> Schedule for F
where
    F: Fn(DateTime<Utc>) -> DateTime<Utc> + Send + Sync + 'static,
{
    fn next(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        self(after)
    }
}

/// Fixed period aligned to the Unix epoch, so every instance computes the same
/// ticks. The period is truncated to whole seconds with a minimum of one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EverySchedule {
    period_secs: i64,
}

impl EverySchedule {
    /// Schedule firing every `period`.
    pub fn new(period: Duration) -> Self {
        let period_secs = i64::try_from(period.as_secs()).unwrap_or(i64::MAX).max(1);
        Self { period_secs }
    }

    /// Effective period.
    #[allow(clippy::cast_sign_loss)]
    pub const fn period(&self) -> Duration {
        // period_secs is at least 1
        Duration::from_secs(self.period_secs as u64)
    }
}

impl Schedule for EverySchedule {
    fn next(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let secs = after.timestamp();
        let next = (secs.div_euclid(self.period_secs) + 1).saturating_mul(self.period_secs);
        Utc.timestamp_opt(next, 0).single().unwrap_or(after)
    }
}
