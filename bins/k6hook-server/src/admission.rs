// Admission gate bounding the number of tracked k6 processes

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Maximum concurrent test runs reached")]
pub struct AtCapacity;

/// Fixed pool of run slots. Acquisition never waits: a caller that finds
/// the pool empty is turned away.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    slots: Arc<Semaphore>,
}

/// One occupied slot. Dropping or releasing it returns the slot to the
/// gate, from whichever task happens to own it at that point.
#[derive(Debug)]
pub struct Permit {
    _slot: OwnedSemaphorePermit,
}

impl Permit {
    pub fn release(self) {}
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn try_acquire(&self) -> Result<Permit, AtCapacity> {
        match Arc::clone(&self.slots).try_acquire_owned() {
            Ok(slot) => Ok(Permit { _slot: slot }),
            // The semaphore is never closed
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => Err(AtCapacity),
        }
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}
