//! Runtime adapters that place dispatched tasks on an executor.

pub mod tokio_spawner;

pub use tokio_spawner::TokioSpawner;
