//! Bounded FIFO admission queue with producer backpressure.
//!
//! Free space is tracked by a semaphore holding one permit per empty slot:
//! producers acquire a permit before pushing and the consumer returns it on
//! pop, so a full queue suspends producers instead of rejecting them. Closing
//! the semaphore wakes every suspended producer with `QueueClosed`.
//!
//! The queue has a single consumer (the dispatch loop); item arrival is signalled
//! with `Notify::notify_one`, which stores a wakeup if the consumer is not yet
//! waiting.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, TryAcquireError};

use super::{Job, UnitError};

/// Fixed-capacity FIFO holding jobs that wait for an execution slot.
#[derive(Debug)]
pub struct AdmissionQueue {
    capacity: usize,
    jobs: Mutex<VecDeque<Job>>,
    space: Semaphore,
    ready: Notify,
    closed: AtomicBool,
    len: AtomicUsize,
}

impl AdmissionQueue {
    /// Create a queue holding at most `capacity` jobs.
    ///
    /// # Errors
    ///
    /// `UnitError::Config` when `capacity` is zero or exceeds the semaphore limit.
    pub fn new(capacity: usize) -> Result<Self, UnitError> {
        if capacity == 0 {
            return Err(UnitError::Config("queue_capacity must be greater than 0".into()));
        }
        if capacity > Semaphore::MAX_PERMITS {
            return Err(UnitError::Config(format!(
                "queue_capacity must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(Self {
            capacity,
            jobs: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            space: Semaphore::new(capacity),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            len: AtomicUsize::new(0),
        })
    }

    /// Append a job, suspending while the queue is full.
    ///
    /// # Errors
    ///
    /// `UnitError::QueueClosed` if the queue is closed before or while waiting.
    pub async fn enqueue(&self, job: Job) -> Result<(), UnitError> {
        let permit = self
            .space
            .acquire()
            .await
            .map_err(|_| UnitError::QueueClosed)?;
        permit.forget();
        self.push(job)
    }

    /// Append a job without waiting.
    ///
    /// # Errors
    ///
    /// `UnitError::QueueFull` at capacity, `UnitError::QueueClosed` once closed.
    pub fn try_enqueue(&self, job: Job) -> Result<(), UnitError> {
        match self.space.try_acquire() {
            Ok(permit) => {
                permit.forget();
                self.push(job)
            }
            Err(TryAcquireError::NoPermits) => Err(UnitError::QueueFull),
            Err(TryAcquireError::Closed) => Err(UnitError::QueueClosed),
        }
    }

    fn push(&self, job: Job) -> Result<(), UnitError> {
        {
            let mut jobs = self.jobs.lock();
            // Checked under the lock so a concurrent close+drain cannot miss this job.
            if self.closed.load(Ordering::Acquire) {
                return Err(UnitError::QueueClosed);
            }
            jobs.push_back(job);
            self.len.store(jobs.len(), Ordering::Release);
        }
        self.ready.notify_one();
        Ok(())
    }

    /// Take the oldest job, suspending while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and empty. Cancel-safe: a job is
    /// only removed in the same poll that returns it.
    pub async fn dequeue(&self) -> Option<Job> {
        loop {
            {
                let mut jobs = self.jobs.lock();
                if let Some(job) = jobs.pop_front() {
                    self.len.store(jobs.len(), Ordering::Release);
                    drop(jobs);
                    self.space.add_permits(1);
                    return Some(job);
                }
                if self.closed.load(Ordering::Acquire) {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Stop admitting jobs and wake every waiter. Queued jobs stay until drained.
    pub fn close(&self) {
        {
            let _jobs = self.jobs.lock();
            self.closed.store(true, Ordering::Release);
        }
        self.space.close();
        self.ready.notify_one();
    }

    /// Remove every queued job, oldest first.
    pub fn drain(&self) -> Vec<Job> {
        let mut jobs = self.jobs.lock();
        let drained: Vec<Job> = jobs.drain(..).collect();
        self.len.store(0, Ordering::Release);
        drained
    }

    /// True once `close` was called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of jobs currently queued.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    /// True when no job is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}
