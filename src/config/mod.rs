//! Configuration models for processing units.

pub mod unit;

pub use unit::{
    UnitConfig, UnitSetConfig, ENV_CONCURRENCY_LIMIT, ENV_QUEUE_CAPACITY, ENV_SHUTDOWN_TIMEOUT_MS,
};
