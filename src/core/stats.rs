//! Unit counters and the serializable statistics snapshot.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JobStatus, UnitState};

/// Lifetime job counters shared between the unit and its dispatch loop.
#[derive(Debug, Default)]
pub(crate) struct UnitCounters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl UnitCounters {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record(&self, status: JobStatus) {
        let counter = match status {
            JobStatus::Completed => &self.completed,
            JobStatus::Failed => &self.failed,
            JobStatus::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::Relaxed)
    }

    pub(crate) fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub(crate) fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub(crate) fn cancelled(&self) -> u64 {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of a processing unit.
///
/// Gauges (`queued`, `in_flight`) and counters are read independently, so a
/// snapshot taken under load is approximate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStats {
    /// Identifier of the unit.
    pub unit_id: Uuid,
    /// Lifecycle state.
    pub state: UnitState,
    /// Jobs waiting in the admission queue.
    pub queued: usize,
    /// Tasks currently holding an execution slot.
    pub in_flight: usize,
    /// Configured concurrency limit.
    pub concurrency_limit: usize,
    /// Configured admission queue capacity.
    pub queue_capacity: usize,
    /// Jobs accepted by `submit`.
    pub submitted: u64,
    /// Jobs whose work returned a value.
    pub completed: u64,
    /// Jobs whose work failed or panicked.
    pub failed: u64,
    /// Jobs cancelled before or during execution.
    pub cancelled: u64,
}

impl UnitStats {
    /// Jobs accepted but not yet resolved.
    #[must_use]
    pub const fn pending(&self) -> u64 {
        self.submitted
            .saturating_sub(self.completed + self.failed + self.cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_routes_by_status() {
        let counters = UnitCounters::default();
        counters.record_submitted();
        counters.record_submitted();
        counters.record_submitted();
        counters.record(JobStatus::Completed);
        counters.record(JobStatus::Failed);

        assert_eq!(counters.submitted(), 3);
        assert_eq!(counters.completed(), 1);
        assert_eq!(counters.failed(), 1);
        assert_eq!(counters.cancelled(), 0);
    }

    #[test]
    fn test_stats_serialize_state_and_pending() {
        let stats = UnitStats {
            unit_id: Uuid::nil(),
            state: UnitState::Running,
            queued: 1,
            in_flight: 2,
            concurrency_limit: 2,
            queue_capacity: 4,
            submitted: 5,
            completed: 1,
            failed: 1,
            cancelled: 0,
        };
        assert_eq!(stats.pending(), 3);

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "Running");
        assert_eq!(json["in_flight"], 2);
    }
}
