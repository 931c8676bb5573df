//! Queue backend contract (`spec.md` §4.2).
//!
//! A durable FIFO of serialized [`Job`] records. Built-ins live in
//! [`memory`] and [`file`]; both implement the same [`QueueBackend`] trait
//! so the dispatcher never depends on which is active.

pub mod file;
pub mod memory;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::Result;
use crate::job::Job;

/// Durable FIFO queue of jobs. Implementations must support enqueue, timed
/// dequeue, atomic claim (no two consumers observe the same job), batch
/// pop, size, and clear.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    /// Durably append a serialized job. Never blocks on a full queue —
    /// queues are effectively unbounded unless configured otherwise.
    async fn enqueue(&self, job: Job) -> Result<()>;

    /// Remove and return one job, waiting up to `timeout` if the queue is
    /// currently empty. Returns `None` on timeout, not an error.
    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>>;

    /// Remove and return up to `batch_size` jobs, waiting up to an
    /// aggregate `timeout` across the whole batch.
    async fn pop_batch(&self, batch_size: usize, timeout: Duration) -> Result<Vec<Job>>;

    /// Current number of jobs resident in the queue.
    async fn qsize(&self) -> Result<usize>;

    /// Drop every job currently in the queue.
    async fn clear(&self) -> Result<()>;
}
