//! Builder wiring configuration and collaborators into a [`Scheduler`].

use std::sync::Arc;

use tracing::info;

use crate::config::CronConfig;
use crate::core::{Scheduler, SchedulerError, SchedulerParts};
use crate::infra::alert::{AlertDispatcher, Alerter, LogAlerter};
use crate::infra::sampler::LoadSampler;
use crate::infra::store::SharedStore;
use crate::limiter::RateLimiter;

/// Builds a [`Scheduler`].
///
/// Only the store is required. The sampler defaults to the system sampler
/// (or a fixed zero-load sampler when that feature is off) and the alerter
/// defaults to the configured webhook, falling back to the log.
#[derive(Default)]
pub struct SchedulerBuilder {
    config: CronConfig,
    store: Option<SharedStore>,
    sampler: Option<Arc<dyn LoadSampler>>,
    alerter: Option<Arc<dyn Alerter>>,
    limiter: Option<Arc<RateLimiter>>,
}

impl SchedulerBuilder {
    /// Builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `config`.
    #[must_use]
    pub fn config(mut self, config: CronConfig) -> Self {
        self.config = config;
        self
    }

    /// Shared store every instance talks to.
    #[must_use]
    pub fn store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Local load source.
    #[must_use]
    pub fn sampler(mut self, sampler: Arc<dyn LoadSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    /// Alert destination.
    #[must_use]
    pub fn alerter(mut self, alerter: Arc<dyn Alerter>) -> Self {
        self.alerter = Some(alerter);
        self
    }

    /// Alert rate limiter. Defaults to the process-wide [`RateLimiter::global`].
    #[must_use]
    pub fn limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Validate the configuration and assemble the scheduler.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidConfig`] for an invalid configuration, a
    /// missing store, or a webhook alerter that cannot be constructed.
    pub fn build(self) -> Result<Scheduler, SchedulerError> {
        self.config.validate().map_err(SchedulerError::InvalidConfig)?;
        let store = self
            .store
            .ok_or_else(|| SchedulerError::InvalidConfig("a shared store is required".into()))?;
        let sampler = match self.sampler {
            Some(sampler) => sampler,
            None => default_sampler(&self.config),
        };
        let alerter = match self.alerter {
            Some(alerter) => alerter,
            None => default_alerter(&self.config)?,
        };
        let mut alerts = AlertDispatcher::new(alerter, self.config.alert.window_secs);
        if let Some(limiter) = self.limiter {
            alerts = alerts.with_limiter(limiter);
        }

        info!(
            mode = ?self.config.deploy_mode,
            ranked_set = %self.config.load.ranked_set_key,
            "scheduler configured"
        );
        Ok(Scheduler::from_parts(SchedulerParts {
            config: self.config,
            store,
            sampler,
            alerts,
        }))
    }
}

#[cfg(feature = "system-sampler")]
fn default_sampler(config: &CronConfig) -> Arc<dyn LoadSampler> {
    Arc::new(crate::infra::sampler::SysinfoSampler::new(
        config.load.interface.clone(),
        config.load.instance_ip.clone(),
    ))
}

#[cfg(not(feature = "system-sampler"))]
fn default_sampler(config: &CronConfig) -> Arc<dyn LoadSampler> {
    Arc::new(crate::infra::sampler::FixedSampler::new(
        config.load.instance_ip.clone().unwrap_or_default(),
        0.0,
        0.0,
    ))
}

fn default_alerter(config: &CronConfig) -> Result<Arc<dyn Alerter>, SchedulerError> {
    let url = config
        .alert
        .webhook_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty());
    match url {
        #[cfg(feature = "webhook")]
        Some(url) => {
            let timeout = std::time::Duration::from_secs(config.alert.timeout_secs);
            let alerter = crate::infra::alert::WebhookAlerter::new(url, timeout)
                .map_err(|e| SchedulerError::InvalidConfig(e.to_string()))?;
            Ok(Arc::new(alerter))
        }
        _ => Ok(Arc::new(LogAlerter)),
    }
}
