//! Bounded number of concurrently served client connections

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{GenproxyError, Result};

/// Caps the number of client connections served at once
#[derive(Clone)]
pub struct ConnectionLimiter {
    permits: Arc<Semaphore>,
    max_connections: usize,
}

impl ConnectionLimiter {
    /// Create a limiter
    ///
    /// # Errors
    ///
    /// Returns a configuration error if `max_connections` is 0
    pub fn new(max_connections: usize) -> Result<Self> {
        if max_connections == 0 {
            return Err(GenproxyError::Config(
                "max_connections must be > 0".to_string(),
            ));
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(max_connections)),
            max_connections,
        })
    }

    /// Take a slot without waiting; `None` when at capacity
    pub fn try_acquire(&self) -> Option<ConnectionSlot> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| ConnectionSlot { _permit: permit })
    }

    /// Connections currently being served
    #[must_use]
    pub fn active_connections(&self) -> usize {
        self.max_connections - self.permits.available_permits()
    }

    /// Configured capacity
    #[must_use]
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// Held for the lifetime of a served connection
pub struct ConnectionSlot {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(
            ConnectionLimiter::new(0),
            Err(GenproxyError::Config(_))
        ));
    }

    #[test]
    fn test_acquire_until_full() {
        let limiter = ConnectionLimiter::new(2).unwrap();

        let first = limiter.try_acquire();
        let second = limiter.try_acquire();
        assert!(first.is_some() && second.is_some());
        assert_eq!(limiter.active_connections(), 2);

        assert!(limiter.try_acquire().is_none());
    }

    #[test]
    fn test_slot_released_on_drop() {
        let limiter = ConnectionLimiter::new(1).unwrap();

        {
            let _slot = limiter.try_acquire().unwrap();
            assert_eq!(limiter.active_connections(), 1);
        }

        assert_eq!(limiter.active_connections(), 0);
        assert!(limiter.try_acquire().is_some());
    }
}
