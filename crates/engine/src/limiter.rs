//! Per-connection backpressure.
//!
//! Each client connection may have at most `max_in_flight` concurrent
//! turns or approval resolutions. The excess is rejected immediately,
//! before any I/O happens on its behalf.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};

use tb_domain::Error;

/// In-flight cap for one client connection.
pub struct BackpressureLimiter {
    permits: Arc<Semaphore>,
    max_in_flight: usize,
}

impl BackpressureLimiter {
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
        }
    }

    /// Claim an in-flight slot, or reject with backpressure. The slot is
    /// returned when the permit drops.
    pub fn try_acquire(&self) -> Result<OwnedSemaphorePermit, Error> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => Ok(permit),
            Err(TryAcquireError::NoPermits) | Err(TryAcquireError::Closed) => {
                Err(Error::Backpressure(format!(
                    "too many concurrent requests (limit {})",
                    self.max_in_flight
                )))
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.permits.available_permits()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_at_capacity_before_any_io() {
        let limiter = BackpressureLimiter::new(2);
        let _p1 = limiter.try_acquire().unwrap();
        let _p2 = limiter.try_acquire().unwrap();
        assert_eq!(limiter.in_flight(), 2);

        let err = limiter.try_acquire().unwrap_err();
        assert_eq!(err.code(), "backpressure");
    }

    #[test]
    fn dropping_a_permit_frees_a_slot() {
        let limiter = BackpressureLimiter::new(1);
        let permit = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_err());

        drop(permit);
        assert!(limiter.try_acquire().is_ok());
    }
}
