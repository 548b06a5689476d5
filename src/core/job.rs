//! Jobs, completion handles, and the per-task execution context.
//!
//! A job pairs the submitted work with a single-resolution outcome slot. The
//! submitter keeps the [`CompletionHandle`]; the unit keeps the type-erased
//! [`Job`] until it is dispatched, skipped, or drained.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use super::{JobError, TaskError};

/// Identifier assigned to each submitted job, unique per unit.
pub type JobId = u64;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCEL_REQUESTED: u8 = 2;
const RESOLVED: u8 = 3;

/// Lifecycle of a single job as observed through its handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    /// Waiting in the admission queue.
    Queued,
    /// Dispatched and executing.
    Running,
    /// Executing, and the submitter asked for cancellation.
    CancelRequested,
    /// The handle has its outcome.
    Resolved,
}

impl JobState {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            QUEUED => Self::Queued,
            RUNNING => Self::Running,
            CANCEL_REQUESTED => Self::CancelRequested,
            _ => Self::Resolved,
        }
    }
}

/// Coarse classification of a finished job, used for accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    /// Work returned a value.
    Completed,
    /// Work returned an error or panicked.
    Failed,
    /// Job never ran, or its result was discarded by cancellation.
    Cancelled,
}

/// Outcome written exactly once to a job's handle.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    /// The work produced a value.
    Completed(T),
    /// The work failed.
    Failed(TaskError),
    /// The job was cancelled.
    Cancelled,
}

impl<T> TaskOutcome<T> {
    /// Convert into the caller-facing result.
    ///
    /// # Errors
    ///
    /// Returns `JobError::Task` for failures and `JobError::Cancelled` for cancellation.
    pub fn into_result(self) -> Result<T, JobError> {
        match self {
            Self::Completed(value) => Ok(value),
            Self::Failed(err) => Err(JobError::Task(err)),
            Self::Cancelled => Err(JobError::Cancelled),
        }
    }

    /// Accounting status for this outcome.
    pub const fn status(&self) -> JobStatus {
        match self {
            Self::Completed(_) => JobStatus::Completed,
            Self::Failed(_) => JobStatus::Failed,
            Self::Cancelled => JobStatus::Cancelled,
        }
    }
}

/// Execution context handed to every task.
///
/// Cancellation is cooperative: the unit never drops a running task on its own
/// (short of a shutdown timeout), so long-running work should watch
/// [`TaskContext::cancelled`].
#[derive(Debug, Clone)]
pub struct TaskContext {
    job_id: JobId,
    token: CancellationToken,
}

impl TaskContext {
    pub(crate) const fn new(job_id: JobId, token: CancellationToken) -> Self {
        Self { job_id, token }
    }

    /// Identifier of the job this task belongs to.
    #[must_use]
    pub const fn job_id(&self) -> JobId {
        self.job_id
    }

    /// True once the submitter or the unit requested cancellation.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// Token that can be handed to nested operations.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Work that can be submitted as a value rather than a closure.
///
/// # Example
///
/// ```rust,ignore
/// use async_trait::async_trait;
/// use prometheus_processing_unit::core::{TaskContext, Work};
///
/// struct Resize { width: u32 }
///
/// #[async_trait]
/// impl Work<u32> for Resize {
///     async fn execute(self, _ctx: TaskContext) -> anyhow::Result<u32> {
///         Ok(self.width / 2)
///     }
/// }
/// ```
#[async_trait]
pub trait Work<T>: Send + Sized + 'static
where
    T: Send + 'static,
{
    /// Run the work to completion.
    async fn execute(self, ctx: TaskContext) -> anyhow::Result<T>;
}

/// Shared single-resolution cell behind a job.
struct JobCell<T> {
    id: JobId,
    state: AtomicU8,
    token: CancellationToken,
    sender: Mutex<Option<oneshot::Sender<TaskOutcome<T>>>>,
}

impl<T> JobCell<T> {
    fn current_state(&self) -> JobState {
        JobState::from_raw(self.state.load(Ordering::Acquire))
    }

    /// Write the outcome. Returns false if the cell was already resolved.
    fn resolve(&self, outcome: TaskOutcome<T>) -> bool {
        let Some(sender) = self.sender.lock().take() else {
            return false;
        };
        self.state.store(RESOLVED, Ordering::Release);
        // The submitter may have dropped its handle.
        let _ = sender.send(outcome);
        true
    }
}

/// Type-erased control surface the unit uses on queued and running jobs.
pub(crate) trait JobControl: Send + Sync {
    fn id(&self) -> JobId;
    fn state(&self) -> JobState;
    fn token(&self) -> &CancellationToken;
    /// Submitter-side cancellation.
    fn cancel(&self);
    /// `Queued -> Running`. False when the job was cancelled before dispatch.
    fn begin(&self) -> bool;
    /// Resolve as cancelled unless already resolved.
    fn abandon(&self) -> bool;
}

impl<T: Send + 'static> JobControl for JobCell<T> {
    fn id(&self) -> JobId {
        self.id
    }

    fn state(&self) -> JobState {
        self.current_state()
    }

    fn token(&self) -> &CancellationToken {
        &self.token
    }

    fn cancel(&self) {
        self.token.cancel();
        if self
            .state
            .compare_exchange(QUEUED, RESOLVED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.resolve(TaskOutcome::Cancelled);
        } else {
            let _ = self.state.compare_exchange(
                RUNNING,
                CANCEL_REQUESTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    fn begin(&self) -> bool {
        self.state
            .compare_exchange(QUEUED, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn abandon(&self) -> bool {
        self.resolve(TaskOutcome::Cancelled)
    }
}

pub(crate) type JobFuture = Pin<Box<dyn Future<Output = JobStatus> + Send + 'static>>;
pub(crate) type JobWork = Box<dyn FnOnce(TaskContext) -> JobFuture + Send + 'static>;

/// Resolves the job as cancelled if the work is dropped before it resolves,
/// whether it never ran or was aborted mid-flight.
struct AbandonOnDrop<T>(Arc<JobCell<T>>);

impl<T> Drop for AbandonOnDrop<T> {
    fn drop(&mut self) {
        self.0.resolve(TaskOutcome::Cancelled);
    }
}

/// A queued unit of work paired with its completion slot.
pub struct Job {
    control: Arc<dyn JobControl>,
    work: JobWork,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.control.id())
            .field("state", &self.control.state())
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Build a job and the handle its submitter will await.
    ///
    /// The job's cancellation token is a child of `parent`, so cancelling the
    /// parent reaches every job created from it.
    pub fn new<T, F, Fut, E>(id: JobId, parent: &CancellationToken, task: F) -> (Self, CompletionHandle<T>)
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let cell = Arc::new(JobCell {
            id,
            state: AtomicU8::new(QUEUED),
            token: parent.child_token(),
            sender: Mutex::new(Some(sender)),
        });

        let guard = AbandonOnDrop(Arc::clone(&cell));
        let work: JobWork = Box::new(move |ctx: TaskContext| -> JobFuture {
            Box::pin(async move {
                let run_cell = &guard.0;
                let watch = ctx.clone();
                let result = AssertUnwindSafe(async move { task(ctx).await })
                    .catch_unwind()
                    .await;

                let outcome = match result {
                    Ok(Ok(value)) => TaskOutcome::Completed(value),
                    Ok(Err(_)) if watch.is_cancelled() => TaskOutcome::Cancelled,
                    Ok(Err(err)) => TaskOutcome::Failed(TaskError::Failed(err.into())),
                    Err(panic) => TaskOutcome::Failed(TaskError::Panicked(panic_message(panic.as_ref()))),
                };
                // Submitter cancelled while running: the value is discarded.
                let outcome = if run_cell.current_state() == JobState::CancelRequested {
                    TaskOutcome::Cancelled
                } else {
                    outcome
                };

                let status = outcome.status();
                run_cell.resolve(outcome);
                status
            })
        });

        let handle = CompletionHandle { cell: Arc::clone(&cell), receiver };
        (Self { control: cell, work }, handle)
    }

    /// Identifier of this job.
    #[must_use]
    pub fn id(&self) -> JobId {
        self.control.id()
    }

    /// True once the submitter cancelled this job.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.token().is_cancelled()
    }

    pub(crate) fn into_parts(self) -> (Arc<dyn JobControl>, JobWork) {
        (self.control, self.work)
    }
}

/// Single-resolution future exposed to a job's submitter.
///
/// Awaiting it yields the task's value, its failure, or `JobError::Cancelled`.
/// Dropping the handle does not cancel the job.
pub struct CompletionHandle<T> {
    cell: Arc<JobCell<T>>,
    receiver: oneshot::Receiver<TaskOutcome<T>>,
}

impl<T: Send + 'static> CompletionHandle<T> {
    /// Identifier of the underlying job.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.cell.id
    }

    /// Request cancellation.
    ///
    /// A job still in the admission queue resolves as cancelled at once and
    /// never runs. A running job is asked to stop through its
    /// [`TaskContext`]; its handle resolves as cancelled when it finishes.
    pub fn cancel(&self) {
        JobControl::cancel(self.cell.as_ref());
    }

    /// True once cancellation was requested by anyone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cell.token.is_cancelled()
    }

    /// Current lifecycle state of the job.
    #[must_use]
    pub fn state(&self) -> JobState {
        self.cell.current_state()
    }

    /// A cloneable capability that can cancel this job from elsewhere.
    #[must_use]
    pub fn canceller(&self) -> JobCanceller {
        JobCanceller {
            control: Arc::clone(&self.cell) as Arc<dyn JobControl>,
        }
    }

    /// Await the outcome for at most `timeout`.
    ///
    /// Elapsing does not cancel the job; cancel through a [`JobCanceller`]
    /// first if the work should stop as well.
    ///
    /// # Errors
    ///
    /// `JobError::Timeout` if the job did not resolve in time, otherwise the
    /// job's own error.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<T, JobError> {
        tokio::time::timeout(timeout, self)
            .await
            .unwrap_or(Err(JobError::Timeout))
    }
}

impl<T> Future for CompletionHandle<T> {
    type Output = Result<T, JobError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.receiver).poll(cx).map(|received| match received {
            Ok(outcome) => outcome.into_result(),
            // Sender dropped unresolved: the unit tore the job down.
            Err(_) => Err(JobError::Cancelled),
        })
    }
}

impl<T> std::fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("job_id", &self.cell.id)
            .field("state", &self.cell.current_state())
            .finish_non_exhaustive()
    }
}

/// Cancel-only capability for a job, detached from its handle.
#[derive(Clone)]
pub struct JobCanceller {
    control: Arc<dyn JobControl>,
}

impl JobCanceller {
    /// Request cancellation, with the same semantics as [`CompletionHandle::cancel`].
    pub fn cancel(&self) {
        self.control.cancel();
    }

    /// True once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.control.token().is_cancelled()
    }
}

impl std::fmt::Debug for JobCanceller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobCanceller")
            .field("job_id", &self.control.id())
            .finish()
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
