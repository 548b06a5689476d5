//! # Prometheus Processing Unit
//!
//! A bounded-concurrency processing unit for async workloads.
//!
//! A unit accepts tasks, queues them when every execution slot is busy, runs at
//! most `concurrency_limit` of them at once, and hands each task's value,
//! failure or cancellation back to its submitter through a
//! [`CompletionHandle`](core::CompletionHandle).
//!
//! ## Key Features
//!
//! - **Backpressure**: `submit` suspends while the admission queue is full
//! - **Strict FIFO dispatch**: jobs start in submission order
//! - **Cancellation both ways**: submitters cancel jobs, shutdown cancels tasks
//! - **Fault isolation**: task errors and panics stay with their handle
//! - **Supervised control loop**: a crashed loop drains the unit and reports why
//!
//! ## Usage
//!
//! ```rust,ignore
//! use prometheus_processing_unit::config::UnitConfig;
//! use prometheus_processing_unit::core::ProcessingUnit;
//! use std::time::Duration;
//!
//! let unit = ProcessingUnit::with_config(
//!     UnitConfig::new(128, 8).with_shutdown_timeout(Duration::from_secs(5)),
//! )?;
//! unit.start()?;
//!
//! let handle = unit.submit(|_ctx| async { Ok::<_, anyhow::Error>(2 + 2) }).await?;
//! assert_eq!(handle.await?, 4);
//!
//! println!("{}", serde_json::to_string(&unit.stats())?);
//! unit.stop().await?;
//! ```
//!
//! Several named units can be built at once from JSON with
//! [`builders::build_units`].

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core processing unit: jobs, admission, slot accounting, dispatch and lifecycle.
pub mod core;
/// Configuration models for processing units.
pub mod config;
/// Builders to construct processing units from configuration.
pub mod builders;
/// Runtime adapters that place dispatched tasks on an executor.
pub mod runtime;
/// Shared utilities.
pub mod util;
