//! In-memory alerter that records every delivered message.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{AlertError, AlertPayload, Alerter};

/// Keeps delivered alert contents for inspection.
#[derive(Debug, Default)]
pub struct RecordingAlerter {
    sent: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl RecordingAlerter {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail with a transport error while set.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Release);
    }

    /// Contents delivered so far, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl Alerter for RecordingAlerter {
    async fn send(&self, payload: &AlertPayload) -> Result<(), AlertError> {
        if self.failing.load(Ordering::Acquire) {
            return Err(AlertError::Transport("recording alerter set to fail".into()));
        }
        self.sent.lock().push(payload.text.content.clone());
        Ok(())
    }
}
