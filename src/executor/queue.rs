//! Back-pressure for concurrent executions.
//!
//! A semaphore caps simultaneous sandboxes at the operator-configured
//! ceiling. New executions wait for a slot up to the queue deadline;
//! exceeding it fails with `QueueFull`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};

/// Gate on simultaneous executions.
#[derive(Clone)]
pub struct ExecutionGate {
    semaphore: Arc<Semaphore>,
    deadline: Duration,
}

impl ExecutionGate {
    pub fn new(ceiling: usize, deadline: Duration) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(ceiling)),
            deadline,
        }
    }

    /// Acquire an execution slot, waiting up to the queue deadline. The
    /// returned permit holds the slot until dropped.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout(
            self.deadline,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Error::internal("execution gate closed")),
            Err(_) => Err(Error::QueueFull(self.deadline)),
        }
    }

    /// Currently free slots, for diagnostics.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
