//! Worker pool and dispatcher (`spec.md` §4.5).
//!
//! N workers, each owning a private mailbox and an in-flight counter, fed
//! by a single dispatcher that pulls batches off the queue backend and
//! routes each job to the least-loaded worker.

pub mod dispatcher;
pub mod pool;
pub mod worker;

pub use dispatcher::Dispatcher;
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig};
pub use worker::WorkerHandle;
