//! Configuration models for leases, load reporting and alerts.

pub mod cron;

pub use cron::{AlertConfig, CronConfig, DeployMode, LeaseConfig, LoadConfig};
