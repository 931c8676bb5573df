//! Worker Pool - owns the worker set and dispatcher, and drives graceful
//! shutdown (`spec.md` §4.5).
//!
//! Rebuilt from the teacher's semaphore-based concurrency limiter: that
//! shape rate-limits anonymous futures, but jobs here need to land on a
//! *specific* worker's mailbox (so `next_retry_at` scheduling and
//! least-loaded routing both make sense), so the permit/semaphore pattern
//! is replaced by the worker+dispatcher pair. Kept the teacher's atomics
//! stats idiom (`AtomicU64` counters under `Ordering::Relaxed`, a `*Stats`
//! struct with derived-metric methods).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::queue::QueueBackend;
use crate::registry::plugin::Plugin;
use crate::runner::{JobRunner, RunOutcome};

use super::dispatcher::Dispatcher;
use super::worker::{self, WorkerHandle};

/// How many workers to run and how large a batch the dispatcher pulls per
/// `pop_batch` call.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub num_workers: usize,
    pub batch_size: usize,
}

impl WorkerPoolConfig {
    pub fn new(num_workers: usize, batch_size: usize) -> Self {
        Self { num_workers, batch_size }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self { num_workers: 4, batch_size: 16 }
    }
}

/// Outcome counters across every worker in a pool.
#[derive(Default)]
pub struct PoolStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    requeued: AtomicU64,
}

impl PoolStats {
    pub fn record(&self, outcome: &RunOutcome) {
        let counter = match outcome {
            RunOutcome::Success(_) => &self.succeeded,
            RunOutcome::Failed(_) => &self.failed,
            RunOutcome::Requeued(_) => &self.requeued,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn succeeded(&self) -> u64 {
        self.succeeded.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    pub fn requeued(&self) -> u64 {
        self.requeued.load(Ordering::Relaxed)
    }

    /// Fraction of terminal (non-requeued) outcomes that succeeded. `1.0`
    /// when nothing terminal has happened yet.
    pub fn success_rate(&self) -> f64 {
        let succeeded = self.succeeded() as f64;
        let total = succeeded + self.failed() as f64;
        if total == 0.0 {
            1.0
        } else {
            succeeded / total
        }
    }
}

/// N workers and one dispatcher, sharing a single shutdown signal.
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    dispatcher_handle: JoinHandle<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<PoolStats>,
    plugins: Vec<Arc<dyn Plugin>>,
}

impl WorkerPool {
    /// Spin up `config.num_workers` workers and a dispatcher over the
    /// given queue, all sharing `runner` and one shutdown signal
    /// (`spec.md` §4.5).
    pub fn start(runner: Arc<JobRunner>, queue: Arc<dyn QueueBackend>, config: WorkerPoolConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(PoolStats::default());

        let mut handles = Vec::with_capacity(config.num_workers);
        let mut worker_handles = Vec::with_capacity(config.num_workers);
        for id in 0..config.num_workers {
            let (handle, join) = worker::spawn(id, runner.clone(), stats.clone(), shutdown_rx.clone());
            handles.push(Arc::new(handle));
            worker_handles.push(join);
        }

        let dispatcher = Dispatcher::new(queue, handles, config.batch_size);
        let dispatcher_shutdown = shutdown_rx;
        let dispatcher_handle = tokio::spawn(async move { dispatcher.run(dispatcher_shutdown).await });

        Self {
            shutdown_tx,
            dispatcher_handle,
            worker_handles,
            stats,
            plugins: Vec::new(),
        }
    }

    /// Attach the plugins that should be asked to `stop()` last during
    /// shutdown (`spec.md`:144), in the order the capability registry
    /// loaded them.
    pub fn with_plugins(mut self, plugins: Vec<Arc<dyn Plugin>>) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn stats(&self) -> Arc<PoolStats> {
        self.stats.clone()
    }

    /// Request shutdown and wait for the dispatcher to stop and every
    /// worker to drain its mailbox. In-flight queue-backend items that
    /// were never dispatched to a mailbox stay durable for replay
    /// (`spec.md` §5). Plugins are stopped last, after every worker has
    /// exited.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.dispatcher_handle.await;
        for handle in self.worker_handles {
            let _ = handle.await;
        }
        for plugin in &self.plugins {
            if let Err(e) = plugin.stop() {
                warn!(plugin = plugin.name(), error = %e, "plugin stop() failed during shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Value;
    use crate::queue::memory::MemoryQueue;
    use crate::result::memory::MemoryResultBackend;
    use crate::result::ResultBackend;
    use crate::task::{RegisterMode, Task, TaskRegistry};
    use crate::job::Job;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn pool_drains_enqueued_jobs_and_reports_stats() {
        let tasks = TaskRegistry::new();
        tasks
            .register(
                Task::new("noop", Arc::new(|_args, _kwargs, _ctx| Ok(Value::Null))),
                RegisterMode::Strict,
            )
            .await
            .unwrap();
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        let results: Arc<dyn ResultBackend> = Arc::new(MemoryResultBackend::new());
        let runner = Arc::new(JobRunner::new(tasks, queue.clone(), results, 0, 5));

        for _ in 0..20 {
            queue.enqueue(Job::new("noop", vec![], BTreeMap::new())).await.unwrap();
        }

        let pool = WorkerPool::start(runner, queue.clone(), WorkerPoolConfig::new(3, 4));
        let stats = pool.stats();

        // give the dispatcher/workers time to drain the backlog
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        pool.shutdown().await;

        assert_eq!(stats.succeeded(), 20);
        assert_eq!(stats.failed(), 0);
    }

    #[tokio::test]
    async fn shutdown_stops_attached_plugins_after_workers_drain() {
        use crate::registry::plugin::test_support::HelloPlugin;

        let tasks = TaskRegistry::new();
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        let results: Arc<dyn ResultBackend> = Arc::new(MemoryResultBackend::new());
        let runner = Arc::new(JobRunner::new(tasks, queue.clone(), results, 0, 5));

        let plugin = Arc::new(HelloPlugin::new("1.0"));
        let pool = WorkerPool::start(runner, queue, WorkerPoolConfig::new(1, 4))
            .with_plugins(vec![plugin.clone()]);

        assert!(!plugin.was_stopped());
        pool.shutdown().await;
        assert!(plugin.was_stopped());
    }
}
