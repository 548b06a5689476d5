//! Tests for utility functions

use prometheus_processing_unit::util::{init_tracing, init_tracing_with, DEFAULT_FILTER};

#[test]
fn test_init_tracing_is_idempotent() {
    init_tracing();
    init_tracing();
    init_tracing_with("debug");
    assert!(tracing::dispatcher::has_been_set());
}

#[test]
fn test_default_filter_targets_crate() {
    assert!(DEFAULT_FILTER.starts_with("prometheus_processing_unit"));
}
