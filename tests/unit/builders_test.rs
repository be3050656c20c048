//! Tests for builder modules

use std::sync::Arc;
use std::time::Duration;

use prometheus_singleton_cron::builders::SchedulerBuilder;
use prometheus_singleton_cron::config::CronConfig;
use prometheus_singleton_cron::infra::{EverySchedule, FixedSampler, InMemoryStore, RecordingAlerter};

#[test]
fn test_builder_keeps_config() {
    let mut config = CronConfig::default();
    config.load.report_interval_secs = 0;
    let scheduler = SchedulerBuilder::new()
        .config(config.clone())
        .store(Arc::new(InMemoryStore::new()))
        .sampler(Arc::new(FixedSampler::new("10.0.0.1", 0.0, 0.0)))
        .alerter(Arc::new(RecordingAlerter::new()))
        .build()
        .unwrap();
    assert_eq!(scheduler.config(), &config);
}

#[test]
fn test_builder_entries_snapshot() {
    let scheduler = SchedulerBuilder::new()
        .store(Arc::new(InMemoryStore::new()))
        .sampler(Arc::new(FixedSampler::new("10.0.0.1", 0.0, 0.0)))
        .build()
        .unwrap();
    let id = scheduler
        .add("cleanup", EverySchedule::new(Duration::from_secs(300)), || async {})
        .unwrap();

    let entries = scheduler.entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].id, id);
    assert_eq!(entries[0].name, "cleanup");
    assert!(entries[0].prev.is_none());
    assert!(entries[0].lease_token.is_none());
}
