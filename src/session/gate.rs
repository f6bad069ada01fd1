//! Admission control for acquisition pipelines.
//!
//! The gate bounds how many sessions may be downloading or transcoding at
//! once. It never queues: when every slot is taken, [`ConcurrencyGate::try_acquire`]
//! fails immediately and the caller is expected to retry later.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use vidrelay_common::{Error, Result};

/// Fixed-capacity, non-blocking admission gate.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One occupied gate slot. Dropping it releases the slot, so a slot is
/// returned exactly once no matter which path lets go of it.
#[derive(Debug)]
pub struct AcquisitionSlot {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Take a slot without waiting.
    ///
    /// # Errors
    ///
    /// [`Error::CapacityExceeded`] when all slots are in use.
    pub fn try_acquire(&self) -> Result<AcquisitionSlot> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Ok(AcquisitionSlot { _permit: permit }),
            Err(TryAcquireError::NoPermits) => Err(Error::CapacityExceeded {
                in_flight: self.in_flight(),
                capacity: self.capacity,
            }),
            Err(TryAcquireError::Closed) => Err(Error::Internal("concurrency gate closed".into())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.capacity.saturating_sub(self.semaphore.available_permits())
    }
}
