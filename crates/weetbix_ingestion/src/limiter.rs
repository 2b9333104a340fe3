//! Process-wide limit on concurrently running ingestion tasks.
//!
//! Each task holds a permit for its whole body. The permit is returned when
//! the guard drops, including on early return and panic.

use crate::error::TaskError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use weetbix_protocol::defaults::DEFAULT_MAX_CONCURRENT_TASKS;

#[derive(Debug, Clone)]
pub struct TaskLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl Default for TaskLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENT_TASKS)
    }
}

impl TaskLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, TaskError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| TaskError::transient("task limiter closed"))
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
