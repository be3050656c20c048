//! # Prometheus Singleton Cron
//!
//! Exactly-once cron execution across a fleet of identical service instances.
//!
//! Every instance runs the same scheduler with the same jobs. Instances never
//! talk to each other directly; they coordinate through a shared key-value
//! store so that each scheduled tick of a job runs on exactly one of them.
//!
//! ## Core Problem Solved
//!
//! Running a scheduler on every replica is simple to deploy but turns every
//! cron job into N concurrent runs:
//!
//! - **Duplicate ticks**: every replica sees the same fire time at the same moment
//! - **Overlapping runs**: a slow run can still be going when the next tick arrives
//! - **Cold-start races**: replicas booting together all believe they are first
//! - **Uneven load**: the busiest replica is as likely to win as the idlest
//!
//! ## Key Features
//!
//! - **Token-owned leases**: set-if-absent claims with atomic compare-and-delete
//!   release and compare-and-expire renewal
//! - **Two-key tick guard**: a tick-scoped claim plus a job-scoped run claim
//! - **Load-aware preference**: replicas publish load scores; non-best replicas
//!   back off briefly before claiming
//! - **Single-flight**: in-process deduplication of concurrent identical calls
//! - **Rate-limited alerts**: overruns and lost leases reach a webhook at most
//!   once per window
//!
//! ## Scheduler
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use prometheus_singleton_cron::builders::SchedulerBuilder;
//! use prometheus_singleton_cron::config::CronConfig;
//! use prometheus_singleton_cron::infra::{EverySchedule, InMemoryStore};
//!
//! let scheduler = SchedulerBuilder::new()
//!     .config(CronConfig::from_env()?)
//!     .store(Arc::new(InMemoryStore::new()))
//!     .build()?;
//!
//! scheduler.add("daily-report", EverySchedule::new(Duration::from_secs(86_400)), || async {
//!     build_daily_report().await;
//! })?;
//! scheduler.start();
//! // ...
//! scheduler.stop().await;
//! ```
//!
//! ## Leases
//!
//! ```rust,ignore
//! use prometheus_singleton_cron::core::{DistributedLease, LeaseOptions};
//!
//! let lease = DistributedLease::new(store, "rebuild-index", LeaseOptions::new().with_auto_renew(true));
//! lease.spin_acquire(Duration::from_secs(5)).await?;
//! rebuild_index().await;
//! lease.release().await?;
//! ```
//!
//! For complete examples, see:
//! - `tests/scheduler_test.rs` - multi-instance scheduling scenarios
//! - `tests/lease_test.rs` - lease exclusivity, renewal and spin acquisition

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Leases, tick guards, load selection and the scheduler.
pub mod core;
/// Configuration models for leases, load reporting and alerts.
pub mod config;
/// Builders to construct scheduler components from configuration.
pub mod builders;
/// Infrastructure adapters: shared store, alerts, sampling, schedules.
pub mod infra;
/// Process-local alert rate limiter.
pub mod limiter;
/// In-process call deduplication.
pub mod single_flight;
/// Shared utilities.
pub mod util;

pub use crate::builders::SchedulerBuilder;
pub use crate::core::{DistributedLease, LockError, Scheduler, TickGuard, TickOutcome};
pub use crate::limiter::{check_limiter, RateLimiter};
pub use crate::single_flight::Group;
