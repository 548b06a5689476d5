//! Tests for tokio spawner utilities

use prometheus_processing_unit::config::UnitConfig;
use prometheus_processing_unit::core::{ProcessingUnit, Spawn};
use prometheus_processing_unit::runtime::tokio_spawner::TokioSpawner;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tokio_spawner_spawn() {
    let spawner = TokioSpawner::new(tokio::runtime::Handle::current());

    let (tx, rx) = tokio::sync::oneshot::channel();
    spawner.spawn(async move {
        tx.send(123).unwrap();
    });

    let result = rx.await.expect("oneshot result");
    assert_eq!(result, 123);
}

#[tokio::test]
async fn test_default_spawner_uses_ambient_runtime() {
    let (tx, rx) = tokio::sync::oneshot::channel();
    TokioSpawner::default().spawn(async move {
        tx.send("ambient").unwrap();
    });
    assert_eq!(rx.await.unwrap(), "ambient");
}

#[test]
fn test_unit_on_dedicated_runtime() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");
    let unit = ProcessingUnit::with_spawner(
        UnitConfig::new(8, 2),
        TokioSpawner::new(runtime.handle().clone()),
    )
    .expect("unit");

    runtime.block_on(async {
        unit.start().unwrap();
        let handle = unit
            .submit(|ctx| async move { Ok::<_, anyhow::Error>(ctx.job_id()) })
            .await
            .unwrap();
        assert_eq!(handle.await.unwrap(), 1);
        unit.stop().await.unwrap();
    });
}
