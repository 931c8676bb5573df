//! Task registry: name → invocable callable + static metadata.
//!
//! Grounded on `original_source/nuvom/registry/registry.py`'s `TaskRegistry`
//! (force/silent/strict duplicate handling) and `spec.md` §4.7's
//! `Task`/`enqueue`/`map`/`submit` contract.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::codec::Value;
use crate::error::{NuvomError, Result};
use crate::job::{AfterHook, BackoffStrategy, BeforeHook, Job, JobContext, JobError, OnErrorHook, TimeoutPolicy};
use crate::queue::QueueBackend;

/// A task invocable: synchronous body run on the blocking pool by the
/// runner, given decoded args/kwargs and a [`JobContext`].
pub type Invocable =
    Arc<dyn Fn(&[Value], &BTreeMap<String, Value>, &JobContext) -> std::result::Result<Value, JobError> + Send + Sync>;

/// Static, listable metadata attached to a task at registration time
/// (`spec.md` §4.7: "tags coerced to `List[str]`, description, category").
#[derive(Debug, Clone, Default)]
pub struct TaskMetadata {
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub category: Option<String>,
}

/// A named invocable with default retry/timeout policy and hooks.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    pub invocable: Invocable,
    pub default_retries: u32,
    pub default_timeout_secs: Option<u64>,
    pub default_timeout_policy: TimeoutPolicy,
    pub default_retry_delay_secs: Option<u64>,
    pub backoff: BackoffStrategy,
    pub metadata: TaskMetadata,
    pub before_job: Option<BeforeHook>,
    pub after_job: Option<AfterHook>,
    pub on_error: Option<OnErrorHook>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("default_retries", &self.default_retries)
            .field("default_timeout_secs", &self.default_timeout_secs)
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl Task {
    pub fn new(name: impl Into<String>, invocable: Invocable) -> Self {
        Self {
            name: name.into(),
            invocable,
            default_retries: 0,
            default_timeout_secs: None,
            default_timeout_policy: TimeoutPolicy::default(),
            default_retry_delay_secs: None,
            backoff: BackoffStrategy::default(),
            metadata: TaskMetadata::default(),
            before_job: None,
            after_job: None,
            on_error: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.default_timeout_secs = Some(secs);
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.default_timeout_policy = policy;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.metadata.tags = tags;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.metadata.category = Some(category.into());
        self
    }

    /// Build a fresh, unqueued [`Job`] with this task's defaults.
    fn build_job(&self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Job {
        let mut job = Job::new(self.name.clone(), args, kwargs).with_retries(self.default_retries);
        job = job.with_timeout_policy(self.default_timeout_policy);
        if let Some(secs) = self.default_timeout_secs {
            job = job.with_timeout_secs(secs);
        }
        if let Some(secs) = self.default_retry_delay_secs {
            job = job.with_retry_delay_secs(secs);
        }
        job.before_job = self.before_job.clone();
        job.after_job = self.after_job.clone();
        job.on_error = self.on_error.clone();
        job
    }

    /// Construct a Job from this task's defaults and submit it to the
    /// given queue backend (`spec.md` §4.7).
    pub async fn enqueue(
        &self,
        queue: &dyn QueueBackend,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Job> {
        let job = self.build_job(args, kwargs);
        queue.enqueue(job.clone()).await?;
        Ok(job)
    }

    /// `submit` is an alias of `enqueue` (`spec.md` §4.7).
    pub async fn submit(
        &self,
        queue: &dyn QueueBackend,
        args: Vec<Value>,
        kwargs: BTreeMap<String, Value>,
    ) -> Result<Job> {
        self.enqueue(queue, args, kwargs).await
    }

    /// Enqueue many jobs sharing this task's defaults, one per element of
    /// `args_iter`, each with empty kwargs.
    pub async fn map(&self, queue: &dyn QueueBackend, args_iter: Vec<Vec<Value>>) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(args_iter.len());
        for args in args_iter {
            jobs.push(self.enqueue(queue, args, BTreeMap::new()).await?);
        }
        Ok(jobs)
    }
}

/// Duplicate-registration handling mode (`spec.md` §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterMode {
    /// Overwrite the existing task.
    Force,
    /// Silently keep the existing task, ignoring the new one. Default.
    Silent,
    /// Fail with `NuvomError::duplicate` on conflict.
    Strict,
}

impl Default for RegisterMode {
    fn default() -> Self {
        Self::Silent
    }
}

#[derive(Debug, Default)]
struct RegistryInner {
    tasks: BTreeMap<String, Arc<Task>>,
}

/// Name → invocable + metadata, guarded by a small lock (`spec.md` §4.9:
/// "reads dominate"). Matches `original_source/nuvom/registry/registry.py`'s
/// `TaskRegistry` semantics.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner::default())),
        }
    }

    /// Register a task. Default mode is `Silent`, tolerating reloads from
    /// a discovery manifest.
    pub async fn register(&self, task: Task, mode: RegisterMode) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.tasks.contains_key(&task.name) {
            match mode {
                RegisterMode::Force => {
                    debug!(task = %task.name, "overwriting registered task");
                    inner.tasks.insert(task.name.clone(), Arc::new(task));
                    Ok(())
                }
                RegisterMode::Silent => {
                    warn!(task = %task.name, "duplicate task registration ignored");
                    Ok(())
                }
                RegisterMode::Strict => Err(NuvomError::duplicate("task", &task.name)),
            }
        } else {
            inner.tasks.insert(task.name.clone(), Arc::new(task));
            Ok(())
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Task>> {
        self.inner.read().await.tasks.get(name).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<Task>> {
        self.inner.read().await.tasks.values().cloned().collect()
    }

    pub async fn names(&self) -> Vec<String> {
        self.inner.read().await.tasks.keys().cloned().collect()
    }

    pub async fn clear(&self) {
        self.inner.write().await.tasks.clear();
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.tasks.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryQueue;

    fn noop_task(name: &str) -> Task {
        Task::new(
            name,
            Arc::new(|_args, _kwargs, _ctx| Ok(Value::Null)),
        )
    }

    #[tokio::test]
    async fn silent_registration_keeps_first() {
        let registry = TaskRegistry::new();
        registry.register(noop_task("add"), RegisterMode::Silent).await.unwrap();
        registry
            .register(noop_task("add").with_retries(9), RegisterMode::Silent)
            .await
            .unwrap();
        let task = registry.get("add").await.unwrap();
        assert_eq!(task.default_retries, 0);
    }

    #[tokio::test]
    async fn strict_registration_rejects_duplicate() {
        let registry = TaskRegistry::new();
        registry.register(noop_task("add"), RegisterMode::Strict).await.unwrap();
        let err = registry.register(noop_task("add"), RegisterMode::Strict).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn force_registration_overwrites() {
        let registry = TaskRegistry::new();
        registry.register(noop_task("add"), RegisterMode::Silent).await.unwrap();
        registry
            .register(noop_task("add").with_retries(3), RegisterMode::Force)
            .await
            .unwrap();
        let task = registry.get("add").await.unwrap();
        assert_eq!(task.default_retries, 3);
    }

    #[tokio::test]
    async fn enqueue_builds_job_from_defaults() {
        let task = noop_task("add").with_retries(2).with_timeout_secs(5);
        let queue = MemoryQueue::new(0);
        let job = task.enqueue(&queue, vec![Value::Int(2), Value::Int(3)], BTreeMap::new()).await.unwrap();
        assert_eq!(job.func_name, "add");
        assert_eq!(job.max_retries, 2);
        assert_eq!(job.timeout_secs, Some(5));
        assert_eq!(queue.qsize().await.unwrap(), 1);
    }
}
