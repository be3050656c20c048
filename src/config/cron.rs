//! Scheduler configuration structures.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::core::AppResult;
use crate::core::DEFAULT_RANKED_SET_KEY;

/// Prefix for every environment variable read by [`CronConfig::from_env`].
pub const ENV_PREFIX: &str = "CRON_";

/// Deployment mode. Alerts are only sent in production.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployMode {
    /// Local and test deployments.
    #[default]
    Development,
    /// Production fleet.
    Production,
}

impl FromStr for DeployMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "dev" | "development" => Ok(Self::Development),
            "prod" | "production" => Ok(Self::Production),
            other => Err(format!("unknown deploy mode `{other}`")),
        }
    }
}

/// Lease behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseConfig {
    /// Pause between spin-acquire attempts, in milliseconds.
    pub spin_retry_ms: u64,
    /// How long the run key outlives the tick key, in seconds.
    pub run_key_margin_secs: u64,
    /// Renew the run key while a job executes.
    pub auto_renew: bool,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            spin_retry_ms: 100,
            run_key_margin_secs: 3,
            auto_renew: true,
        }
    }
}

impl LeaseConfig {
    /// Spin-acquire cadence.
    pub const fn spin_retry(&self) -> Duration {
        Duration::from_millis(self.spin_retry_ms)
    }

    /// Run-key margin.
    pub const fn run_key_margin(&self) -> Duration {
        Duration::from_secs(self.run_key_margin_secs)
    }
}

/// Load reporting and candidate selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    /// Name of the shared ranked set.
    pub ranked_set_key: String,
    /// Seconds between periodic load reports; 0 disables them.
    pub report_interval_secs: u64,
    /// Network interface whose address identifies this instance.
    pub interface: String,
    /// Explicit instance address, overriding interface lookup.
    pub instance_ip: Option<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            ranked_set_key: DEFAULT_RANKED_SET_KEY.to_owned(),
            report_interval_secs: 60,
            interface: "eth0".to_owned(),
            instance_ip: None,
        }
    }
}

/// Alert delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Chat webhook; alerts are only logged when unset.
    pub webhook_url: Option<String>,
    /// Throttle window per alert key, in seconds.
    pub window_secs: i64,
    /// Prefix for alert rate-limit keys.
    pub key_prefix: String,
    /// Webhook request timeout, in seconds.
    pub timeout_secs: u64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            window_secs: 3600,
            key_prefix: "cron".to_owned(),
            timeout_secs: 5,
        }
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CronConfig {
    /// Deployment mode.
    pub deploy_mode: DeployMode,
    /// Lease behaviour.
    pub lease: LeaseConfig,
    /// Load reporting.
    pub load: LoadConfig,
    /// Alert delivery.
    pub alert: AlertConfig,
}

impl CronConfig {
    /// True in production deployments.
    pub fn is_production(&self) -> bool {
        self.deploy_mode == DeployMode::Production
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.lease.spin_retry_ms == 0 {
            return Err("lease.spin_retry_ms must be greater than 0".into());
        }
        if self.load.ranked_set_key.trim().is_empty() {
            return Err("load.ranked_set_key must not be empty".into());
        }
        if self.alert.window_secs < 0 {
            return Err("alert.window_secs must not be negative".into());
        }
        if self.alert.key_prefix.trim().is_empty() {
            return Err("alert.key_prefix must not be empty".into());
        }
        if self.alert.timeout_secs == 0 {
            return Err("alert.timeout_secs must be greater than 0".into());
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults overridden by `CRON_*` environment variables, after loading
    /// a `.env` file if one exists.
    ///
    /// # Errors
    ///
    /// Fails when a variable cannot be parsed or the result is invalid.
    pub fn from_env() -> AppResult<Self> {
        // a missing .env file is normal
        let _ = dotenvy::dotenv();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns for each `CRON_*` name.
    ///
    /// # Errors
    ///
    /// Fails when a value cannot be parsed or the result is invalid.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> AppResult<Self> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}")).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(v) = var("DEPLOY_MODE") {
            cfg.deploy_mode = v.parse().map_err(anyhow::Error::msg)?;
        }
        if let Some(v) = var("SPIN_RETRY_MS") {
            cfg.lease.spin_retry_ms = v.trim().parse().context("CRON_SPIN_RETRY_MS")?;
        }
        if let Some(v) = var("RUN_KEY_MARGIN_SECS") {
            cfg.lease.run_key_margin_secs = v.trim().parse().context("CRON_RUN_KEY_MARGIN_SECS")?;
        }
        if let Some(v) = var("AUTO_RENEW") {
            cfg.lease.auto_renew = v.trim().parse().context("CRON_AUTO_RENEW")?;
        }
        if let Some(v) = var("RANKED_SET_KEY") {
            cfg.load.ranked_set_key = v;
        }
        if let Some(v) = var("REPORT_INTERVAL_SECS") {
            cfg.load.report_interval_secs = v.trim().parse().context("CRON_REPORT_INTERVAL_SECS")?;
        }
        if let Some(v) = var("INTERFACE") {
            cfg.load.interface = v;
        }
        if let Some(v) = var("INSTANCE_IP") {
            cfg.load.instance_ip = Some(v);
        }
        if let Some(v) = var("WEBHOOK_URL") {
            cfg.alert.webhook_url = Some(v);
        }
        if let Some(v) = var("ALERT_WINDOW_SECS") {
            cfg.alert.window_secs = v.trim().parse().context("CRON_ALERT_WINDOW_SECS")?;
        }
        if let Some(v) = var("ALERT_KEY_PREFIX") {
            cfg.alert.key_prefix = v;
        }
        if let Some(v) = var("ALERT_TIMEOUT_SECS") {
            cfg.alert.timeout_secs = v.trim().parse().context("CRON_ALERT_TIMEOUT_SECS")?;
        }

        cfg.validate().map_err(anyhow::Error::msg)?;
        Ok(cfg)
    }
}
