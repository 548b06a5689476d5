//! Tests for builder modules

use prometheus_processing_unit::builders::{build_units, start_units};
use prometheus_processing_unit::config::{UnitConfig, UnitSetConfig};
use prometheus_processing_unit::core::{UnitError, UnitState};
use prometheus_processing_unit::runtime::TokioSpawner;

fn unit_set(entries: &[(&str, UnitConfig)]) -> UnitSetConfig {
    UnitSetConfig {
        units: entries
            .iter()
            .map(|(name, cfg)| ((*name).to_string(), cfg.clone()))
            .collect(),
    }
}

#[tokio::test]
async fn test_build_and_start_units() {
    let cfg = unit_set(&[
        ("fast", UnitConfig::new(32, 4)),
        ("slow", UnitConfig::new(2, 1)),
    ]);
    let units = build_units(&cfg, &TokioSpawner::current()).expect("units built");
    assert_eq!(units.len(), 2);
    assert!(units.values().all(|unit| unit.state() == UnitState::Created));
    assert_eq!(units["fast"].stats().concurrency_limit, 4);
    assert_ne!(units["fast"].id(), units["slow"].id());

    start_units(&units).expect("units started");
    let handle = units["slow"]
        .submit(|_ctx| async { Ok::<_, anyhow::Error>("done") })
        .await
        .unwrap();
    assert_eq!(handle.await.unwrap(), "done");

    let (name, err) = start_units(&units).unwrap_err();
    assert!(units.contains_key(&name));
    assert_eq!(err, UnitError::AlreadyStarted);

    for unit in units.values() {
        unit.stop().await.unwrap();
    }
}

#[test]
fn test_build_units_rejects_invalid_config() {
    let cfg = unit_set(&[("empty-queue", UnitConfig::new(0, 1))]);
    let err = build_units(&cfg, &TokioSpawner::default()).unwrap_err();
    assert!(matches!(err, UnitError::Config(msg) if msg.contains("empty-queue")));
}
