//! Dispatch loop: moves jobs from the admission queue onto free execution slots.
//!
//! The loop is the only owner of the in-flight registry. Spawned tasks never
//! touch it; they report back through the completion channel and the loop
//! releases their slot. Any inconsistency between the registry, the gate and
//! the completion stream is returned as `UnitError::LoopFault`.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{AbortHandle, Abortable};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::admission::AdmissionQueue;
use super::gate::{ConcurrencyGate, Slot, SlotReservation};
use super::job::JobControl;
use super::stats::UnitCounters;
use super::{Job, JobId, JobStatus, TaskContext, UnitError};

/// Abstraction over the runtime that executes dispatched tasks.
pub trait Spawn {
    /// Spawn a detached future.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Where the dispatch loop currently is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    /// Waiting for the gate to free a slot.
    WaitingForSlot,
    /// Holding a reservation, waiting for the queue to yield a job.
    WaitingForJob,
    /// Committing the slot and spawning the task.
    Launching,
    /// Not dispatching: before the first cycle or after a stop request.
    Idle,
}

/// Message a finished task sends back to the loop.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Completion {
    pub(crate) job_id: JobId,
    pub(crate) status: JobStatus,
}

struct InFlight {
    control: Arc<dyn JobControl>,
    slot: Slot,
    abort: AbortHandle,
}

/// Shared pieces a dispatch loop is wired to.
pub(crate) struct DispatchParts<S> {
    pub(crate) unit_id: Uuid,
    pub(crate) queue: Arc<AdmissionQueue>,
    pub(crate) gate: ConcurrencyGate,
    pub(crate) counters: Arc<UnitCounters>,
    pub(crate) spawner: S,
    pub(crate) stop: CancellationToken,
    pub(crate) jobs_token: CancellationToken,
    pub(crate) shutdown_timeout: Option<Duration>,
}

pub(crate) struct DispatchLoop<S> {
    unit_id: Uuid,
    queue: Arc<AdmissionQueue>,
    gate: ConcurrencyGate,
    counters: Arc<UnitCounters>,
    spawner: S,
    registry: HashMap<JobId, InFlight>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    stop: CancellationToken,
    jobs_token: CancellationToken,
    shutdown_timeout: Option<Duration>,
    phase: DispatchPhase,
}

impl<S> DispatchLoop<S>
where
    S: Spawn + Send + Sync + 'static,
{
    pub(crate) fn new(parts: DispatchParts<S>) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            unit_id: parts.unit_id,
            queue: parts.queue,
            gate: parts.gate,
            counters: parts.counters,
            spawner: parts.spawner,
            registry: HashMap::new(),
            completions_tx,
            completions_rx,
            stop: parts.stop,
            jobs_token: parts.jobs_token,
            shutdown_timeout: parts.shutdown_timeout,
            phase: DispatchPhase::Idle,
        }
    }

    /// Sender side of the completion channel, for injecting faults in tests.
    #[cfg(test)]
    pub(crate) fn completion_sender(&self) -> mpsc::UnboundedSender<Completion> {
        self.completions_tx.clone()
    }

    fn enter(&mut self, phase: DispatchPhase) {
        if self.phase != phase {
            tracing::trace!(unit_id = %self.unit_id, ?phase, "dispatch phase");
            self.phase = phase;
        }
    }

    /// Run until a stop is requested or the queue is closed and empty.
    ///
    /// # Errors
    ///
    /// `UnitError::LoopFault` when the loop's own bookkeeping breaks.
    pub(crate) async fn run(&mut self) -> Result<(), UnitError> {
        tracing::debug!(unit_id = %self.unit_id, "dispatch loop started");
        loop {
            self.enter(DispatchPhase::WaitingForSlot);
            let reservation = tokio::select! {
                biased;
                () = self.stop.cancelled() => break,
                Some(done) = self.completions_rx.recv() => {
                    self.complete(done)?;
                    continue;
                }
                reservation = self.gate.acquire() => reservation?,
            };

            self.enter(DispatchPhase::WaitingForJob);
            let job = loop {
                tokio::select! {
                    biased;
                    () = self.stop.cancelled() => {
                        self.enter(DispatchPhase::Idle);
                        return Ok(());
                    }
                    Some(done) = self.completions_rx.recv() => self.complete(done)?,
                    job = self.queue.dequeue() => match job {
                        Some(job) => break job,
                        None => {
                            self.enter(DispatchPhase::Idle);
                            return Ok(());
                        }
                    },
                }
            };

            self.enter(DispatchPhase::Launching);
            self.launch(job, reservation)?;
        }
        self.enter(DispatchPhase::Idle);
        Ok(())
    }

    fn launch(&mut self, job: Job, reservation: SlotReservation) -> Result<(), UnitError> {
        let (control, work) = job.into_parts();
        let job_id = control.id();

        if !control.begin() {
            // Cancelled while queued; the reservation goes back uncounted.
            control.abandon();
            drop(work);
            drop(reservation);
            self.counters.record(JobStatus::Cancelled);
            tracing::debug!(unit_id = %self.unit_id, job_id, "skipped cancelled job");
            return Ok(());
        }
        if self.registry.contains_key(&job_id) {
            return Err(UnitError::LoopFault(format!(
                "job {job_id} dispatched twice"
            )));
        }

        let slot = reservation.commit()?;
        let ctx = TaskContext::new(job_id, control.token().clone());
        let (abort, registration) = AbortHandle::new_pair();
        let completions = self.completions_tx.clone();

        self.spawner.spawn(async move {
            let status = Abortable::new(work(ctx), registration)
                .await
                .unwrap_or(JobStatus::Cancelled);
            // The loop may already be gone after a shutdown timeout.
            let _ = completions.send(Completion { job_id, status });
        });
        self.registry.insert(job_id, InFlight { control, slot, abort });

        tracing::debug!(
            unit_id = %self.unit_id,
            job_id,
            in_flight = self.gate.in_flight(),
            queued = self.queue.len(),
            "job dispatched"
        );
        Ok(())
    }

    fn complete(&mut self, done: Completion) -> Result<(), UnitError> {
        let entry = self.registry.remove(&done.job_id).ok_or_else(|| {
            UnitError::LoopFault(format!("completion for unknown job {}", done.job_id))
        })?;
        entry.slot.release()?;
        self.counters.record(done.status);
        tracing::debug!(
            unit_id = %self.unit_id,
            job_id = done.job_id,
            status = ?done.status,
            in_flight = self.gate.in_flight(),
            "job finished"
        );
        Ok(())
    }

    /// Resolve every queued and in-flight job.
    ///
    /// Closes the queue, cancels queued jobs without running them, signals
    /// every running task and waits for it, bounded by the shutdown timeout.
    /// Tasks still running when it elapses are aborted and resolved as
    /// cancelled. Returns the first bookkeeping fault seen while draining.
    pub(crate) async fn drain(&mut self) -> Result<(), UnitError> {
        self.enter(DispatchPhase::Idle);
        self.queue.close();

        let mut fault = None;
        let queued = self.queue.drain();
        let dropped = queued.len();
        for job in queued {
            let (control, work) = job.into_parts();
            control.abandon();
            drop(work);
            self.counters.record(JobStatus::Cancelled);
        }

        self.jobs_token.cancel();
        tracing::info!(
            unit_id = %self.unit_id,
            queued = dropped,
            in_flight = self.registry.len(),
            "draining unit"
        );

        let reaped = match self.shutdown_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.reap_in_flight(&mut fault))
                .await
                .is_ok(),
            None => {
                self.reap_in_flight(&mut fault).await;
                true
            }
        };

        if !reaped {
            tracing::warn!(
                unit_id = %self.unit_id,
                remaining = self.registry.len(),
                "shutdown timeout elapsed, aborting in-flight tasks"
            );
            for (job_id, entry) in self.registry.drain() {
                entry.abort.abort();
                entry.control.abandon();
                if let Err(err) = entry.slot.release() {
                    fault.get_or_insert(err);
                }
                self.counters.record(JobStatus::Cancelled);
                tracing::debug!(unit_id = %self.unit_id, job_id, "aborted task");
            }
        }

        fault.map_or(Ok(()), Err)
    }

    async fn reap_in_flight(&mut self, fault: &mut Option<UnitError>) {
        while !self.registry.is_empty() {
            let Some(done) = self.completions_rx.recv().await else {
                break;
            };
            if let Err(err) = self.complete(done) {
                fault.get_or_insert(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::core::CompletionHandle;
    use crate::runtime::TokioSpawner;

    fn make_loop(capacity: usize, limit: usize) -> (DispatchLoop<TokioSpawner>, Arc<AdmissionQueue>, CancellationToken) {
        let queue = Arc::new(AdmissionQueue::new(capacity).unwrap());
        let stop = CancellationToken::new();
        let dispatch = DispatchLoop::new(DispatchParts {
            unit_id: Uuid::new_v4(),
            queue: Arc::clone(&queue),
            gate: ConcurrencyGate::new(limit).unwrap(),
            counters: Arc::new(UnitCounters::default()),
            spawner: TokioSpawner::default(),
            stop: stop.clone(),
            jobs_token: CancellationToken::new(),
            shutdown_timeout: None,
        });
        (dispatch, queue, stop)
    }

    fn make_job(dispatch: &DispatchLoop<TokioSpawner>, id: JobId) -> (Job, CompletionHandle<JobId>) {
        Job::new(id, &dispatch.jobs_token, move |_ctx| async move {
            Ok::<_, anyhow::Error>(id)
        })
    }

    #[tokio::test]
    async fn test_runs_queued_jobs_until_queue_closes() {
        let (mut dispatch, queue, _stop) = make_loop(4, 2);
        let mut handles = Vec::new();
        for id in 1..=3 {
            let (job, handle) = make_job(&dispatch, id);
            queue.enqueue(job).await.unwrap();
            handles.push(handle);
        }
        queue.close();

        dispatch.run().await.unwrap();
        dispatch.drain().await.unwrap();

        for (expected, handle) in (1..=3).zip(handles) {
            assert_eq!(handle.await.unwrap(), expected);
        }
        assert_eq!(dispatch.counters.completed(), 3);
        assert_eq!(dispatch.gate.in_flight(), 0);
        assert_eq!(dispatch.phase, DispatchPhase::Idle);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_skipped_without_slot() {
        let (mut dispatch, queue, _stop) = make_loop(4, 1);
        let ran = Arc::new(AtomicUsize::new(0));
        let (job, handle) = {
            let ran = Arc::clone(&ran);
            Job::new(1, &dispatch.jobs_token, move |_ctx| async move {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(())
            })
        };
        queue.enqueue(job).await.unwrap();
        handle.cancel();
        queue.close();

        dispatch.run().await.unwrap();

        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(dispatch.counters.cancelled(), 1);
        assert!(dispatch.gate.is_available());
    }

    #[tokio::test]
    async fn test_unknown_completion_is_fault() {
        let (mut dispatch, _queue, _stop) = make_loop(1, 1);
        dispatch
            .completion_sender()
            .send(Completion { job_id: 99, status: JobStatus::Completed })
            .unwrap();

        assert!(matches!(dispatch.run().await, Err(UnitError::LoopFault(_))));
    }

    #[tokio::test]
    async fn test_drain_timeout_aborts_stuck_task() {
        let (mut dispatch, queue, stop) = make_loop(2, 1);
        dispatch.shutdown_timeout = Some(Duration::from_millis(30));

        let (job, handle) = Job::new(1, &dispatch.jobs_token, |_ctx| async move {
            // Ignores cancellation.
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, anyhow::Error>(())
        });
        queue.enqueue(job).await.unwrap();

        let runner = tokio::spawn(async move {
            let result = dispatch.run().await;
            (dispatch, result)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();
        let (mut dispatch, result) = runner.await.unwrap();
        result.unwrap();

        dispatch.drain().await.unwrap();
        assert!(handle.await.unwrap_err().is_cancelled());
        assert_eq!(dispatch.gate.in_flight(), 0);
        assert!(dispatch.registry.is_empty());
    }
}
