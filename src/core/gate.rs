//! Concurrency gate: the slot accounting that bounds running tasks.
//!
//! Acquisition is two-phase. [`ConcurrencyGate::acquire`] waits for a permit and
//! returns a [`SlotReservation`]; only [`SlotReservation::commit`] counts the slot
//! as in flight. A reservation dropped before commit (the job turned out to be
//! cancelled) hands the permit back without touching the counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use super::UnitError;

/// Counter of free execution slots, bounded by the concurrency limit.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    limit: usize,
    permits: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
}

impl ConcurrencyGate {
    /// Create a gate allowing `limit` concurrent slots.
    ///
    /// # Errors
    ///
    /// `UnitError::Config` when `limit` is zero or exceeds the semaphore limit.
    pub fn new(limit: usize) -> Result<Self, UnitError> {
        if limit == 0 {
            return Err(UnitError::Config(
                "concurrency_limit must be greater than 0".into(),
            ));
        }
        if limit > Semaphore::MAX_PERMITS {
            return Err(UnitError::Config(format!(
                "concurrency_limit must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        Ok(Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
            in_flight: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Wait until a slot is free and reserve it.
    ///
    /// # Errors
    ///
    /// `UnitError::LoopFault` if the underlying semaphore was closed.
    pub async fn acquire(&self) -> Result<SlotReservation, UnitError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| UnitError::LoopFault("concurrency gate closed".into()))?;
        Ok(self.reservation(permit))
    }

    /// Reserve a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<SlotReservation> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| self.reservation(permit))
    }

    fn reservation(&self, permit: OwnedSemaphorePermit) -> SlotReservation {
        SlotReservation {
            permit,
            limit: self.limit,
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    /// True when at least one slot is free.
    pub fn is_available(&self) -> bool {
        self.permits.available_permits() > 0
    }

    /// Slots currently committed to running tasks.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Configured concurrency limit.
    pub const fn limit(&self) -> usize {
        self.limit
    }
}

/// A permit held between acquiring a slot and launching a task.
#[derive(Debug)]
pub struct SlotReservation {
    permit: OwnedSemaphorePermit,
    limit: usize,
    in_flight: Arc<AtomicUsize>,
}

impl SlotReservation {
    /// Count the slot as in flight.
    ///
    /// # Errors
    ///
    /// `UnitError::LoopFault` if the in-flight count would exceed the limit.
    pub fn commit(self) -> Result<Slot, UnitError> {
        let limit = self.limit;
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .map_err(|n| {
                UnitError::LoopFault(format!("in-flight count {n} already at limit {limit}"))
            })?;
        Ok(Slot {
            permit: Some(self.permit),
            in_flight: self.in_flight,
        })
    }
}

/// A committed execution slot, released exactly once.
#[derive(Debug)]
pub struct Slot {
    permit: Option<OwnedSemaphorePermit>,
    in_flight: Arc<AtomicUsize>,
}

impl Slot {
    /// Return the slot to the gate.
    ///
    /// # Errors
    ///
    /// `UnitError::LoopFault` if the in-flight count would drop below zero.
    pub fn release(mut self) -> Result<(), UnitError> {
        self.give_back()
    }

    fn give_back(&mut self) -> Result<(), UnitError> {
        let Some(permit) = self.permit.take() else {
            return Ok(());
        };
        drop(permit);
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|_| ())
            .map_err(|_| UnitError::LoopFault("in-flight count underflow".into()))
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Err(err) = self.give_back() {
            tracing::error!(error = %err, "slot dropped with inconsistent accounting");
        }
    }
}
