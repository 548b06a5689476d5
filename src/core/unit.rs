//! Processing unit: lifecycle control, submission API, and loop supervision.
//!
//! A [`ProcessingUnit`] owns an admission queue, a concurrency gate and a
//! dispatch loop. The loop runs inside a supervisor task; when the loop exits,
//! whether because of a stop request or because it faulted, the supervisor
//! drains every remaining job and moves the unit to `Stopped`.
//!
//! # Example
//!
//! ```rust,ignore
//! use prometheus_processing_unit::core::ProcessingUnit;
//!
//! let unit = ProcessingUnit::new(64, 4)?;
//! unit.start()?;
//!
//! let handle = unit
//!     .submit(|ctx| async move {
//!         tokio::select! {
//!             () = ctx.cancelled() => anyhow::bail!("cancelled"),
//!             () = tokio::time::sleep(std::time::Duration::from_millis(50)) => Ok(42),
//!         }
//!     })
//!     .await?;
//!
//! assert_eq!(handle.await?, 42);
//! unit.stop().await?;
//! ```

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::admission::AdmissionQueue;
use super::dispatch::{DispatchLoop, DispatchParts, Spawn};
use super::gate::ConcurrencyGate;
use super::job::panic_message;
use super::stats::{UnitCounters, UnitStats};
use super::{CompletionHandle, Job, TaskContext, UnitError, Work};
use crate::config::UnitConfig;
use crate::runtime::TokioSpawner;

/// Lifecycle of a processing unit. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitState {
    /// Constructed, not yet started.
    Created,
    /// Accepting and dispatching jobs.
    Running,
    /// Draining queued and in-flight jobs.
    Stopping,
    /// Terminal; every job has been resolved.
    Stopped,
}

/// Bounded-concurrency executor with a FIFO admission queue.
pub struct ProcessingUnit<S = TokioSpawner> {
    id: Uuid,
    config: UnitConfig,
    queue: Arc<AdmissionQueue>,
    gate: ConcurrencyGate,
    counters: Arc<UnitCounters>,
    spawner: S,
    state: Arc<watch::Sender<UnitState>>,
    next_job_id: AtomicU64,
    jobs_token: CancellationToken,
    stop_token: CancellationToken,
    pending: Mutex<Option<DispatchLoop<S>>>,
    last_error: Arc<Mutex<Option<UnitError>>>,
    #[cfg(test)]
    completions: tokio::sync::mpsc::UnboundedSender<super::dispatch::Completion>,
}

impl ProcessingUnit<TokioSpawner> {
    /// Create a unit with the given bounds on the ambient tokio runtime.
    ///
    /// In-flight tasks are awaited without a deadline on `stop`; use
    /// [`ProcessingUnit::with_config`] to bound shutdown.
    ///
    /// # Errors
    ///
    /// `UnitError::Config` when either bound is zero.
    pub fn new(queue_capacity: usize, concurrency_limit: usize) -> Result<Self, UnitError> {
        Self::with_config(UnitConfig::new(queue_capacity, concurrency_limit))
    }

    /// Create a unit from a configuration on the ambient tokio runtime.
    ///
    /// # Errors
    ///
    /// `UnitError::Config` when the configuration fails validation.
    pub fn with_config(config: UnitConfig) -> Result<Self, UnitError> {
        Self::with_spawner(config, TokioSpawner::default())
    }
}

impl<S> ProcessingUnit<S>
where
    S: Spawn + Clone + Send + Sync + 'static,
{
    /// Create a unit whose tasks and supervisor run on `spawner`.
    ///
    /// # Errors
    ///
    /// `UnitError::Config` when the configuration fails validation.
    pub fn with_spawner(config: UnitConfig, spawner: S) -> Result<Self, UnitError> {
        config.validate().map_err(UnitError::Config)?;

        let id = Uuid::new_v4();
        let queue = Arc::new(AdmissionQueue::new(config.queue_capacity)?);
        let gate = ConcurrencyGate::new(config.concurrency_limit)?;
        let counters = Arc::new(UnitCounters::default());
        let jobs_token = CancellationToken::new();
        let stop_token = CancellationToken::new();

        let dispatch = DispatchLoop::new(DispatchParts {
            unit_id: id,
            queue: Arc::clone(&queue),
            gate: gate.clone(),
            counters: Arc::clone(&counters),
            spawner: spawner.clone(),
            stop: stop_token.clone(),
            jobs_token: jobs_token.clone(),
            shutdown_timeout: config.shutdown_timeout(),
        });
        #[cfg(test)]
        let completions = dispatch.completion_sender();

        tracing::debug!(
            unit_id = %id,
            queue_capacity = config.queue_capacity,
            concurrency_limit = config.concurrency_limit,
            "processing unit created"
        );

        Ok(Self {
            id,
            config,
            queue,
            gate,
            counters,
            spawner,
            state: Arc::new(watch::Sender::new(UnitState::Created)),
            next_job_id: AtomicU64::new(0),
            jobs_token,
            stop_token,
            pending: Mutex::new(Some(dispatch)),
            last_error: Arc::new(Mutex::new(None)),
            #[cfg(test)]
            completions,
        })
    }

    /// Launch the dispatch loop. Must be called within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `UnitError::AlreadyStarted` when running, `UnitError::InvalidState`
    /// once stopping or stopped.
    pub fn start(&self) -> Result<(), UnitError> {
        let mut observed = UnitState::Created;
        self.state.send_if_modified(|state| {
            observed = *state;
            if *state == UnitState::Created {
                *state = UnitState::Running;
                true
            } else {
                false
            }
        });
        match observed {
            UnitState::Created => {}
            UnitState::Running => return Err(UnitError::AlreadyStarted),
            other => return Err(UnitError::InvalidState(other)),
        }

        let dispatch = self
            .pending
            .lock()
            .take()
            .ok_or_else(|| UnitError::LoopFault("dispatch loop already taken".into()))?;
        self.spawner.spawn(supervise(
            self.id,
            dispatch,
            Arc::clone(&self.state),
            Arc::clone(&self.last_error),
        ));

        tracing::info!(
            unit_id = %self.id,
            queue_capacity = self.config.queue_capacity,
            concurrency_limit = self.config.concurrency_limit,
            "processing unit started"
        );
        Ok(())
    }

    /// Stop the unit and wait until every job is resolved.
    ///
    /// Queued jobs resolve as cancelled without running; in-flight tasks are
    /// signalled through their [`TaskContext`] and awaited, up to the
    /// configured shutdown timeout. Calling `stop` again, concurrently or
    /// after the fact, only waits for `Stopped`.
    ///
    /// # Errors
    ///
    /// `UnitError::LoopFault` if the dispatch loop crashed; the unit is
    /// stopped either way.
    pub async fn stop(&self) -> Result<(), UnitError> {
        let mut observed = UnitState::Created;
        self.state.send_if_modified(|state| {
            observed = *state;
            match *state {
                UnitState::Created => {
                    *state = UnitState::Stopped;
                    true
                }
                UnitState::Running => {
                    *state = UnitState::Stopping;
                    true
                }
                UnitState::Stopping | UnitState::Stopped => false,
            }
        });

        match observed {
            UnitState::Created => {
                self.queue.close();
                self.pending.lock().take();
                tracing::info!(unit_id = %self.id, "processing unit stopped before start");
            }
            UnitState::Running => {
                tracing::info!(
                    unit_id = %self.id,
                    queued = self.queue.len(),
                    in_flight = self.gate.in_flight(),
                    "stopping processing unit"
                );
                self.stop_token.cancel();
            }
            UnitState::Stopping | UnitState::Stopped => {}
        }

        self.wait_stopped().await;
        self.last_error().map_or(Ok(()), Err)
    }

    /// Wait until the unit reaches `Stopped` without requesting a stop.
    pub async fn wait_stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this only ends on `Stopped`.
        let _ = rx.wait_for(|state| *state == UnitState::Stopped).await;
    }

    /// Submit a task, suspending while the admission queue is full.
    ///
    /// Returns as soon as the job is queued; await the handle for the outcome.
    ///
    /// # Errors
    ///
    /// `UnitError::NotRunning` unless running, `UnitError::QueueClosed` if
    /// the unit begins stopping while this call waits for space.
    pub async fn submit<T, F, Fut, E>(&self, task: F) -> Result<CompletionHandle<T>, UnitError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let (job, handle) = self.prepare(task)?;
        self.queue.enqueue(job).await?;
        self.admitted(&handle);
        Ok(handle)
    }

    /// Submit a task without waiting for queue space.
    ///
    /// # Errors
    ///
    /// `UnitError::QueueFull` at capacity, otherwise as [`ProcessingUnit::submit`].
    pub fn try_submit<T, F, Fut, E>(&self, task: F) -> Result<CompletionHandle<T>, UnitError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        let (job, handle) = self.prepare(task)?;
        self.queue.try_enqueue(job)?;
        self.admitted(&handle);
        Ok(handle)
    }

    /// Submit synchronous work to run on the blocking thread pool.
    ///
    /// The closure holds an execution slot for its whole run. Cancellation
    /// cannot interrupt it, but it can poll [`TaskContext::is_cancelled`].
    ///
    /// # Errors
    ///
    /// As [`ProcessingUnit::submit`].
    pub async fn submit_blocking<T, F>(&self, f: F) -> Result<CompletionHandle<T>, UnitError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> anyhow::Result<T> + Send + 'static,
    {
        self.submit(move |ctx| async move {
            match tokio::task::spawn_blocking(move || f(ctx)).await {
                Ok(result) => result,
                Err(err) => match err.try_into_panic() {
                    Ok(payload) => std::panic::resume_unwind(payload),
                    Err(err) => Err(anyhow::Error::new(err)),
                },
            }
        })
        .await
    }

    /// Submit a [`Work`] value.
    ///
    /// # Errors
    ///
    /// As [`ProcessingUnit::submit`].
    pub async fn submit_work<T, W>(&self, work: W) -> Result<CompletionHandle<T>, UnitError>
    where
        T: Send + 'static,
        W: Work<T>,
    {
        self.submit(move |ctx| work.execute(ctx)).await
    }

    fn prepare<T, F, Fut, E>(&self, task: F) -> Result<(Job, CompletionHandle<T>), UnitError>
    where
        T: Send + 'static,
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<anyhow::Error> + Send + 'static,
    {
        if self.state() != UnitState::Running {
            return Err(UnitError::NotRunning);
        }
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Job::new(job_id, &self.jobs_token, task))
    }

    fn admitted<T: Send + 'static>(&self, handle: &CompletionHandle<T>) {
        self.counters.record_submitted();
        tracing::trace!(
            unit_id = %self.id,
            job_id = handle.job_id(),
            queued = self.queue.len(),
            "job queued"
        );
    }
}

impl<S> ProcessingUnit<S> {
    /// Current lifecycle state.
    pub fn state(&self) -> UnitState {
        *self.state.borrow()
    }

    /// The fault that crashed the dispatch loop, if any.
    pub fn last_error(&self) -> Option<UnitError> {
        self.last_error.lock().clone()
    }

    /// Snapshot of queue depth, in-flight count and lifetime counters.
    pub fn stats(&self) -> UnitStats {
        UnitStats {
            unit_id: self.id,
            state: self.state(),
            queued: self.queue.len(),
            in_flight: self.gate.in_flight(),
            concurrency_limit: self.gate.limit(),
            queue_capacity: self.queue.capacity(),
            submitted: self.counters.submitted(),
            completed: self.counters.completed(),
            failed: self.counters.failed(),
            cancelled: self.counters.cancelled(),
        }
    }

    /// Identifier used to correlate this unit's log events.
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Configuration the unit was built from.
    pub const fn config(&self) -> &UnitConfig {
        &self.config
    }
}

impl<S> std::fmt::Debug for ProcessingUnit<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessingUnit")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> Drop for ProcessingUnit<S> {
    fn drop(&mut self) {
        // A running loop drains on its own; nothing is awaited here.
        self.stop_token.cancel();
    }
}

async fn supervise<S>(
    unit_id: Uuid,
    mut dispatch: DispatchLoop<S>,
    state: Arc<watch::Sender<UnitState>>,
    last_error: Arc<Mutex<Option<UnitError>>>,
) where
    S: Spawn + Send + Sync + 'static,
{
    let fault = match AssertUnwindSafe(dispatch.run()).catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(err)) => Some(err),
        Err(panic) => Some(UnitError::LoopFault(format!(
            "dispatch loop panicked: {}",
            panic_message(panic.as_ref())
        ))),
    };
    if let Some(err) = fault {
        tracing::error!(unit_id = %unit_id, error = %err, "dispatch loop crashed, draining unit");
        *last_error.lock() = Some(err);
    }

    state.send_if_modified(|current| {
        if *current == UnitState::Running {
            *current = UnitState::Stopping;
            true
        } else {
            false
        }
    });

    if let Err(err) = dispatch.drain().await {
        tracing::error!(unit_id = %unit_id, error = %err, "bookkeeping fault while draining");
        last_error.lock().get_or_insert(err);
    }

    state.send_replace(UnitState::Stopped);
    tracing::info!(unit_id = %unit_id, "processing unit stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dispatch::Completion;
    use crate::core::{JobState, JobStatus};

    #[tokio::test]
    async fn test_loop_fault_drains_and_stops() {
        let unit = ProcessingUnit::new(4, 1).unwrap();
        unit.start().unwrap();

        let blocker = unit
            .submit(|ctx| async move {
                ctx.cancelled().await;
                Ok::<_, anyhow::Error>(1)
            })
            .await
            .unwrap();
        let queued = unit
            .submit(|_ctx| async { Ok::<_, anyhow::Error>(2) })
            .await
            .unwrap();
        while blocker.state() != JobState::Running {
            tokio::task::yield_now().await;
        }

        unit.completions
            .send(Completion { job_id: 999, status: JobStatus::Completed })
            .unwrap();
        unit.wait_stopped().await;

        assert!(matches!(unit.last_error(), Some(UnitError::LoopFault(_))));
        assert!(matches!(unit.stop().await, Err(UnitError::LoopFault(_))));
        assert!(queued.await.unwrap_err().is_cancelled());
        // Shutdown cancellation lets a cooperative task still deliver its value.
        assert_eq!(blocker.await.unwrap(), 1);
        assert_eq!(unit.stats().in_flight, 0);
    }

    #[tokio::test]
    async fn test_stop_before_start_is_terminal() {
        let unit = ProcessingUnit::new(1, 1).unwrap();
        unit.stop().await.unwrap();

        assert_eq!(unit.state(), UnitState::Stopped);
        assert_eq!(unit.start(), Err(UnitError::InvalidState(UnitState::Stopped)));
        assert_eq!(
            unit.try_submit(|_ctx| async { Ok::<_, anyhow::Error>(()) }).unwrap_err(),
            UnitError::NotRunning
        );
    }
}
