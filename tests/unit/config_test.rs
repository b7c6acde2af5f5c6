//! Tests for configuration validation

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use prometheus_task_lot::config::{ActivityConfig, SchedulerConfig, StoreBackendConfig};
use prometheus_task_lot::core::ActivityMode;

fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

#[test]
fn test_scheduler_config_defaults() {
    let config = SchedulerConfig::default();
    assert_eq!(config.task_limit, 5);
    assert_eq!(config.cycle_interval_ms, 5_000);
    assert_eq!(config.retention_secs, 604_800);
    assert_eq!(config.store, StoreBackendConfig::InMemory);
    assert!(config.validate().is_ok());

    let options = config.options();
    assert_eq!(options.cycle_interval, Duration::from_secs(5));
    assert_eq!(options.retention, Duration::from_secs(7 * 24 * 3600));
}

#[test]
fn test_scheduler_config_invalid_task_limit() {
    let config = SchedulerConfig {
        task_limit: 0,
        ..SchedulerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_scheduler_config_invalid_activity() {
    let mut config = SchedulerConfig::default();
    config.activities.insert(
        "a".to_string(),
        ActivityConfig {
            retryable: false,
            max_retry_times: Some(2),
            ..ActivityConfig::default()
        },
    );
    let err = config.validate().unwrap_err();
    assert!(err.contains("activity `a`"));
}

#[test]
fn test_scheduler_config_store_needs_path() {
    let config = SchedulerConfig {
        store: StoreBackendConfig::File {
            path: PathBuf::new(),
        },
        ..SchedulerConfig::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_scheduler_config_from_json() {
    let json = r#"{
        "task_limit": 8,
        "store": { "kind": "sqlite", "path": "/var/lib/tasks.db" },
        "activities": {
            "send-email": { "mode": "SEQUENCE", "priority": 3, "max_retry_times": 5 },
            "cleanup": { "retryable": false }
        }
    }"#;

    let config = SchedulerConfig::from_json_str(json).unwrap();
    assert_eq!(config.task_limit, 8);
    assert_eq!(config.cycle_interval_ms, 5_000);
    assert_eq!(
        config.store,
        StoreBackendConfig::Sqlite {
            path: PathBuf::from("/var/lib/tasks.db")
        }
    );
    let email = &config.activities["send-email"];
    assert_eq!(email.mode, ActivityMode::Sequence);
    assert!(email.retryable);
    assert_eq!(email.priority.value(), 3);
    assert_eq!(email.max_retry_times, Some(5));
    assert!(!config.activities["cleanup"].retryable);
}

#[test]
fn test_scheduler_config_from_json_rejects_bad_priority() {
    let json = r#"{ "activities": { "a": { "priority": 42 } } }"#;
    assert!(SchedulerConfig::from_json_str(json).is_err());
}

#[test]
fn test_scheduler_config_env_overrides() {
    let vars = env(&[
        ("TASK_LIMIT", "12"),
        ("TASK_CYCLE_INTERVAL_MS", "250"),
        ("TASK_RETENTION_SECS", "60"),
        ("TASK_STORE", "file"),
        ("TASK_STORE_PATH", "/tmp/tasks.jsonl"),
    ]);
    let config = SchedulerConfig::default()
        .with_overrides(|k| vars.get(k).cloned())
        .unwrap();
    assert_eq!(config.task_limit, 12);
    assert_eq!(config.cycle_interval_ms, 250);
    assert_eq!(config.retention_secs, 60);
    assert_eq!(
        config.store,
        StoreBackendConfig::File {
            path: PathBuf::from("/tmp/tasks.jsonl")
        }
    );
}

#[test]
fn test_scheduler_config_env_errors() {
    let bad_number = env(&[("TASK_LIMIT", "many")]);
    assert!(SchedulerConfig::default()
        .with_overrides(|k| bad_number.get(k).cloned())
        .is_err());

    let missing_path = env(&[("TASK_STORE", "sqlite")]);
    assert!(SchedulerConfig::default()
        .with_overrides(|k| missing_path.get(k).cloned())
        .is_err());

    let unknown = env(&[("TASK_STORE", "redis")]);
    assert!(SchedulerConfig::default()
        .with_overrides(|k| unknown.get(k).cloned())
        .is_err());
}
