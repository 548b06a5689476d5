//! Error types for processing unit operations.

use thiserror::Error;

use super::unit::UnitState;

/// Errors produced by the processing unit and its components.
///
/// Submission errors (`NotRunning`, `QueueClosed`, `QueueFull`) are returned to
/// the caller of `submit` and mean no job was created. `LoopFault` is the
/// unit-level channel: it is never the outcome of an individual task.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    /// Construction parameters were rejected.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// The unit is not in the `Running` state.
    #[error("unit is not running")]
    NotRunning,
    /// The admission queue stopped accepting jobs.
    #[error("admission queue closed")]
    QueueClosed,
    /// The admission queue is at capacity (non-suspending submission only).
    #[error("admission queue full")]
    QueueFull,
    /// `start` was called on a unit that is already running.
    #[error("unit already started")]
    AlreadyStarted,
    /// The requested transition is not valid from the current state.
    #[error("invalid unit state: {0:?}")]
    InvalidState(UnitState),
    /// The dispatch loop itself failed; the unit was drained and stopped.
    #[error("dispatch loop fault: {0}")]
    LoopFault(String),
}

/// Failure raised by submitted work.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task returned an error.
    #[error("task failed: {0:#}")]
    Failed(anyhow::Error),
    /// The task panicked; the payload message is preserved when it is a string.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Terminal outcome of awaiting a [`CompletionHandle`](super::CompletionHandle)
/// other than success.
#[derive(Debug, Error)]
pub enum JobError {
    /// The work ran and failed.
    #[error(transparent)]
    Task(#[from] TaskError),
    /// The job was cancelled, by its submitter or by unit shutdown.
    #[error("job cancelled")]
    Cancelled,
    /// A caller-side wait elapsed before the job resolved.
    #[error("timed out waiting for job")]
    Timeout,
}

impl JobError {
    /// True when the job resolved as cancelled.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
