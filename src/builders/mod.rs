//! Builders to construct processing units from configuration.

pub mod unit_builder;

pub use unit_builder::{build_units, start_units};
