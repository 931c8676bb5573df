#![allow(clippy::result_large_err)]
//! # Nuvom
//!
//! A distributed-style task queue for background job execution on a single
//! host, with pluggable storage.
//!
//! - **Job Runner**: executes one job with a per-job timeout, classifies
//!   outcomes, invokes lifecycle hooks, re-enqueues on retry.
//! - **Worker Pool + Dispatcher**: N workers each with a private mailbox;
//!   a dispatcher pulls batches and routes to the least-loaded worker.
//! - **Scheduler**: cron/interval/once schedules materialized into the
//!   queue on a min-heap tick loop.
//! - **Capability Registry**: pluggable `queue_backend`/`result_backend`
//!   providers, resolved by name.

pub mod codec;
pub mod config;
pub mod discovery;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod result;
pub mod runner;
pub mod scheduler;
pub mod task;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, NuvomError, Result};

/// Re-exports of the types most call sites need.
pub mod prelude {
    pub use crate::codec::{CodecKind, Value};
    pub use crate::config::Config;
    pub use crate::discovery::{ManifestDiff, ManifestManager, ScheduledTaskReference, TaskReference};
    pub use crate::error::{ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity, NuvomError, Result};
    pub use crate::job::{BackoffStrategy, Job, JobContext, JobError, JobId, JobStatus, TimeoutPolicy};
    pub use crate::orchestrator::{Dispatcher, WorkerPool};
    pub use crate::queue::QueueBackend;
    pub use crate::registry::{CapabilityRegistry, PluginLoader, PluginManifest};
    pub use crate::result::{ResultBackend, ResultRecord};
    pub use crate::runner::{JobRunner, RunOutcome};
    pub use crate::scheduler::{MisfirePolicy, Schedule, ScheduleType, Scheduler};
    pub use crate::task::{RegisterMode, Task, TaskRegistry};
}
