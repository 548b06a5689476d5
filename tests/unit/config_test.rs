//! Tests for configuration validation

use std::time::Duration;

use prometheus_processing_unit::config::{UnitConfig, UnitSetConfig};

#[test]
fn test_unit_config_validation() {
    assert!(UnitConfig::new(16, 4).validate().is_ok());
    assert!(UnitConfig::new(0, 4).validate().is_err());
    assert!(UnitConfig::new(16, 0).validate().is_err());

    let mut zero_timeout = UnitConfig::new(16, 4);
    zero_timeout.shutdown_timeout_ms = Some(0);
    assert!(zero_timeout.validate().is_err());
}

#[test]
fn test_unit_config_defaults() {
    let cfg = UnitConfig::default();
    assert!(cfg.concurrency_limit >= 1);
    assert_eq!(cfg.queue_capacity, cfg.concurrency_limit * 16);
    assert_eq!(cfg.shutdown_timeout(), Some(Duration::from_secs(10)));
    assert!(cfg.validate().is_ok());

    assert_eq!(UnitConfig::new(8, 2).shutdown_timeout(), None);
}

#[test]
fn test_with_shutdown_timeout() {
    let cfg = UnitConfig::new(8, 2).with_shutdown_timeout(Duration::from_millis(1500));
    assert_eq!(cfg.shutdown_timeout_ms, Some(1500));
    assert_eq!(cfg.shutdown_timeout(), Some(Duration::from_millis(1500)));
}

#[test]
fn test_unit_config_from_json() {
    let cfg = UnitConfig::from_json_str(r#"{"queue_capacity": 32, "concurrency_limit": 4}"#)
        .expect("valid json");
    assert_eq!(cfg.queue_capacity, 32);
    assert_eq!(cfg.concurrency_limit, 4);
    assert_eq!(cfg.shutdown_timeout_ms, Some(10_000));

    let unbounded = UnitConfig::from_json_str(
        r#"{"queue_capacity": 32, "concurrency_limit": 4, "shutdown_timeout_ms": null}"#,
    )
    .expect("valid json");
    assert_eq!(unbounded.shutdown_timeout(), None);
}

#[test]
fn test_unit_config_from_json_errors() {
    let err = UnitConfig::from_json_str("{not json").unwrap_err();
    assert!(err.starts_with("parse error"));

    let err = UnitConfig::from_json_str(r#"{"queue_capacity": 0, "concurrency_limit": 4}"#)
        .unwrap_err();
    assert!(err.contains("queue_capacity"));
}

#[test]
fn test_unit_set_config() {
    let json = r#"{
        "units": {
            "ingest": { "queue_capacity": 64, "concurrency_limit": 8 },
            "render": { "queue_capacity": 4, "concurrency_limit": 1, "shutdown_timeout_ms": 500 }
        }
    }"#;
    let cfg = UnitSetConfig::from_json_str(json).expect("valid unit set");
    assert_eq!(cfg.units.len(), 2);
    assert_eq!(cfg.units["render"].shutdown_timeout_ms, Some(500));

    let empty = UnitSetConfig::from_json_str(r#"{"units": {}}"#).unwrap_err();
    assert!(empty.contains("at least one unit"));

    let bad = UnitSetConfig::from_json_str(
        r#"{"units": {"broken": {"queue_capacity": 1, "concurrency_limit": 0}}}"#,
    )
    .unwrap_err();
    assert!(bad.contains("unit `broken` invalid"));
}
