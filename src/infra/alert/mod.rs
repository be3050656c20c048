//! Alert delivery.
//!
//! An [`Alerter`] delivers one message. The [`AlertDispatcher`] sits in front
//! of it, throttles keyed alerts through a [`RateLimiter`] and swallows
//! delivery failures so they never reach the scheduling path.

pub mod memory;
#[cfg(feature = "webhook")]
pub mod webhook;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::limiter::RateLimiter;

pub use memory::RecordingAlerter;
#[cfg(feature = "webhook")]
pub use webhook::WebhookAlerter;

/// Default throttle window for keyed alerts.
pub const DEFAULT_ALERT_WINDOW_SECS: i64 = 3600;

/// Errors from a single delivery attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AlertError {
    /// The request could not be sent.
    #[error("alert transport error: {0}")]
    Transport(String),
    /// The receiver answered with a non-success status.
    #[error("alert rejected with status {0}")]
    Status(u16),
    /// No destination is configured.
    #[error("alert destination not configured")]
    NotConfigured,
}

/// Text body of an alert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertText {
    /// Message content.
    pub content: String,
}

/// Wire payload: `{"msgtype":"text","text":{"content":...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertPayload {
    /// Always `text`.
    pub msgtype: String,
    /// Message body.
    pub text: AlertText,
}

impl AlertPayload {
    /// Plain-text payload.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            msgtype: "text".to_owned(),
            text: AlertText {
                content: content.into(),
            },
        }
    }
}

/// Delivers alert payloads somewhere.
#[async_trait]
pub trait Alerter: Send + Sync + 'static {
    /// Deliver one payload.
    async fn send(&self, payload: &AlertPayload) -> Result<(), AlertError>;
}

/// Writes alerts to the log. Used when no webhook is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn send(&self, payload: &AlertPayload) -> Result<(), AlertError> {
        warn!("alert: {}", payload.text.content);
        Ok(())
    }
}

/// Rate-limited, failure-swallowing front for an [`Alerter`].
#[derive(Clone)]
pub struct AlertDispatcher {
    alerter: Arc<dyn Alerter>,
    limiter: Arc<RateLimiter>,
    window_secs: i64,
}

impl AlertDispatcher {
    /// Dispatcher on the process-wide limiter with the given window.
    ///
    /// Every dispatcher built this way shares suppression state, so a key
    /// alerted by one scheduler is throttled for all schedulers in the
    /// process.
    pub fn new(alerter: Arc<dyn Alerter>, window_secs: i64) -> Self {
        Self {
            alerter,
            limiter: Arc::clone(RateLimiter::global()),
            window_secs,
        }
    }

    /// Use `limiter` instead of the process-wide one.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    /// Throttle window for keyed alerts.
    pub const fn window_secs(&self) -> i64 {
        self.window_secs
    }

    /// Send `content`. Keyed alerts are dropped while their window is open.
    ///
    /// Returns true when the alert was delivered.
    pub async fn alert(&self, content: &str, key: Option<&str>) -> bool {
        if let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) {
            if !self.limiter.check(key, self.window_secs) {
                debug!("alert {} suppressed by rate limiter", key);
                return false;
            }
        }
        match self.alerter.send(&AlertPayload::text(content)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("alert delivery failed: {}", e);
                false
            }
        }
    }
}

impl std::fmt::Debug for AlertDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertDispatcher")
            .field("window_secs", &self.window_secs)
            .finish_non_exhaustive()
    }
}
