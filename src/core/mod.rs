//! Core processing unit: jobs, admission, slot accounting, dispatch and lifecycle.

pub mod admission;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod job;
pub mod stats;
pub mod unit;

pub use admission::AdmissionQueue;
pub use dispatch::{DispatchPhase, Spawn};
pub use error::{AppResult, JobError, TaskError, UnitError};
pub use gate::{ConcurrencyGate, Slot, SlotReservation};
pub use job::{
    CompletionHandle, Job, JobCanceller, JobId, JobState, JobStatus, TaskContext, TaskOutcome, Work,
};
pub use stats::UnitStats;
pub use unit::{ProcessingUnit, UnitState};
