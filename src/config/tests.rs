use super::load_config;
use super::settings::{PartialBrokerSettings, PartialSettings, Settings};
use serial_test::serial;
use std::env;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.broker.ack_deadline_secs, 10);
    assert_eq!(settings.broker.ack_deadline(), Duration::from_secs(10));
    assert_eq!(settings.broker.max_delivery_attempts, None);
    assert_eq!(settings.broker.max_outstanding_messages, None);
    assert_eq!(settings.broker.lease_sweep_interval_ms, 1000);
    assert!(settings.storage.enabled);
    assert_eq!(settings.storage.path, "pullsub_db");
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn test_partial_merge_keeps_defaults_for_missing_values() {
    let partial = PartialSettings {
        broker: Some(PartialBrokerSettings {
            ack_deadline_secs: Some(30),
            max_outstanding_messages: Some(5),
            ..Default::default()
        }),
        ..Default::default()
    };
    let merged = partial.merge(Settings::default());
    assert_eq!(merged.broker.ack_deadline_secs, 30);
    assert_eq!(merged.broker.max_outstanding_messages, Some(5));
    assert_eq!(merged.broker.lease_sweep_interval_ms, 1000);
    assert_eq!(merged.storage, Settings::default().storage);
}

#[test]
fn test_subscription_config_from_broker_settings() {
    let mut settings = Settings::default();
    settings.broker.max_outstanding_bytes = Some(1024);
    settings.broker.max_delivery_attempts = Some(3);
    let cfg = settings
        .broker
        .subscription_config(Duration::from_secs(20));
    assert_eq!(cfg.ack_deadline, Duration::from_secs(20));
    assert_eq!(cfg.flow_control.max_outstanding_bytes, Some(1024));
    assert_eq!(cfg.flow_control.max_outstanding_messages, None);
    assert_eq!(cfg.max_delivery_attempts, Some(3));
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    // load_config reads config/default.toml relative to the cwd
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [broker]
        ack_deadline_secs = 45
        max_delivery_attempts = 5

        [storage]
        enabled = false
        path = "/tmp/elsewhere"

        [logging]
        level = "debug"
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();

    // restore cwd before asserting so a failure doesn't leak into other tests
    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.broker.ack_deadline_secs, 45);
    assert_eq!(cfg.broker.max_delivery_attempts, Some(5));
    assert_eq!(cfg.broker.lease_sweep_interval_ms, 1000);
    assert!(!cfg.storage.enabled);
    assert_eq!(cfg.storage.path, "/tmp/elsewhere");
    assert_eq!(cfg.logging.level, "debug");
}

#[test]
#[serial]
fn load_config_from_environment() {
    temp_env::with_vars(
        [
            ("PULLSUB__BROKER__ACK_DEADLINE_SECS", Some("3")),
            ("PULLSUB__BROKER__MAX_OUTSTANDING_MESSAGES", Some("7")),
            ("PULLSUB__LOGGING__LEVEL", Some("warn")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.broker.ack_deadline_secs, 3);
            assert_eq!(cfg.broker.max_outstanding_messages, Some(7));
            assert_eq!(cfg.logging.level, "warn");
        },
    );
}
