//! Webhook alerter.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{AlertError, AlertPayload, Alerter};

/// POSTs alert payloads as JSON to a chat webhook.
#[derive(Debug, Clone)]
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    /// Alerter posting to `url` with a per-request timeout.
    ///
    /// # Errors
    ///
    /// [`AlertError::NotConfigured`] for an empty URL, or
    /// [`AlertError::Transport`] if the HTTP client cannot be built.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, AlertError> {
        let url = url.into();
        if url.trim().is_empty() {
            return Err(AlertError::NotConfigured);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AlertError::Transport(e.to_string()))?;
        Ok(Self { client, url })
    }

    /// Destination URL.
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn send(&self, payload: &AlertPayload) -> Result<(), AlertError> {
        let resp = self
            .client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .map_err(|e| AlertError::Transport(e.to_string()))?;
        let status = resp.status();
        debug!("webhook alert answered {}", status);
        if !status.is_success() {
            return Err(AlertError::Status(status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_url_is_not_configured() {
        let err = WebhookAlerter::new("  ", Duration::from_secs(1)).unwrap_err();
        assert_eq!(err, AlertError::NotConfigured);
    }
}
