//! Tests for configuration validation

use std::collections::HashMap;

use prometheus_singleton_cron::config::{CronConfig, DeployMode};

#[test]
fn test_default_config_is_valid() {
    let cfg = CronConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.deploy_mode, DeployMode::Development);
    assert_eq!(cfg.lease.spin_retry_ms, 100);
    assert_eq!(cfg.lease.run_key_margin_secs, 3);
    assert_eq!(cfg.load.ranked_set_key, "server_load_info");
    assert_eq!(cfg.alert.window_secs, 3600);
}

#[test]
fn test_partial_json_fills_defaults() {
    let cfg = CronConfig::from_json_str(
        r#"{"deploy_mode": "production", "alert": {"webhook_url": "https://hooks.example/x"}}"#,
    )
    .unwrap();
    assert!(cfg.is_production());
    assert_eq!(cfg.alert.webhook_url.as_deref(), Some("https://hooks.example/x"));
    assert_eq!(cfg.alert.key_prefix, "cron");
    assert_eq!(cfg.load.interface, "eth0");
}

#[test]
fn test_json_validation_errors() {
    let err = CronConfig::from_json_str(r#"{"lease": {"spin_retry_ms": 0}}"#).unwrap_err();
    assert!(err.contains("spin_retry_ms"));

    let err = CronConfig::from_json_str("{not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}

#[test]
fn test_lookup_overrides() {
    let vars: HashMap<&str, &str> = [
        ("CRON_DEPLOY_MODE", "prod"),
        ("CRON_INSTANCE_IP", "10.1.2.3"),
        ("CRON_RUN_KEY_MARGIN_SECS", "10"),
        ("CRON_REPORT_INTERVAL_SECS", "0"),
        ("CRON_WEBHOOK_URL", ""),
    ]
    .into_iter()
    .collect();

    let cfg = CronConfig::from_lookup(|name| vars.get(name).map(|v| (*v).to_string())).unwrap();
    assert_eq!(cfg.deploy_mode, DeployMode::Production);
    assert_eq!(cfg.load.instance_ip.as_deref(), Some("10.1.2.3"));
    assert_eq!(cfg.lease.run_key_margin_secs, 10);
    assert_eq!(cfg.load.report_interval_secs, 0);
    assert_eq!(cfg.alert.webhook_url, None);
}

#[test]
fn test_lookup_rejects_bad_numbers() {
    let result = CronConfig::from_lookup(|name| {
        (name == "CRON_SPIN_RETRY_MS").then(|| "fast".to_string())
    });
    assert!(result.is_err());

    let result = CronConfig::from_lookup(|name| {
        (name == "CRON_DEPLOY_MODE").then(|| "staging".to_string())
    });
    assert!(result.is_err());
}
