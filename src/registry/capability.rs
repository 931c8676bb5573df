//! Capability registry: `(capability, name) -> provider` (`spec.md` §4.1).
//!
//! Grounded on `original_source/nuvom/plugins/registry.py`'s `_Registry`:
//! a process-wide map of `capability -> {name -> provider}`, built-ins
//! lazily populated exactly once, `get` falling back to the sole provider
//! when a capability has exactly one and no name was given.
//!
//! `spec.md` names exactly two capabilities (`queue_backend`,
//! `result_backend`); rather than a single `Any`-erased map (which would
//! force callers to downcast), each capability gets its own typed bucket —
//! idiomatic Rust trades the Python original's fully dynamic map for two
//! small ones with the same lock/lookup shape.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{NuvomError, Result};
use crate::queue::file::FileQueue;
use crate::queue::memory::MemoryQueue;
use crate::queue::QueueBackend;
use crate::result::file::FileResultBackend;
use crate::result::memory::MemoryResultBackend;
use crate::result::sqlite::SqliteResultBackend;
use crate::result::ResultBackend;

pub const CAP_QUEUE_BACKEND: &str = "queue_backend";
pub const CAP_RESULT_BACKEND: &str = "result_backend";

#[derive(Default)]
struct RegistryInner {
    queue_backends: HashMap<String, Arc<dyn QueueBackend>>,
    result_backends: HashMap<String, Arc<dyn ResultBackend>>,
    builtins_done: bool,
}

/// Process-wide `(capability, name) -> provider` map, guarded by a single
/// lock (`spec.md` §4.1: "all mutations under a single recursive lock").
pub struct CapabilityRegistry {
    inner: RwLock<RegistryInner>,
}

impl Default for CapabilityRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve `name` (or the sole entry when `name` is absent) from a bucket.
fn resolve<'a, V>(
    capability: &str,
    bucket: &'a HashMap<String, V>,
    name: Option<&str>,
) -> Result<&'a V> {
    match name {
        Some(n) => bucket.get(n).ok_or_else(|| NuvomError::not_found(capability, Some(n))),
        None => match bucket.len() {
            0 => Err(NuvomError::not_found(capability, None)),
            1 => Ok(bucket.values().next().unwrap()),
            _ => Err(NuvomError::ambiguous(capability)),
        },
    }
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    /// Register a queue backend provider under `name`. Fails with
    /// `Duplicate` unless `override_` is set.
    pub async fn register_queue_backend(
        &self,
        name: &str,
        provider: Arc<dyn QueueBackend>,
        override_: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.queue_backends.contains_key(name) && !override_ {
            return Err(NuvomError::duplicate(CAP_QUEUE_BACKEND, name));
        }
        debug!(capability = CAP_QUEUE_BACKEND, name, "registering capability provider");
        inner.queue_backends.insert(name.to_string(), provider);
        Ok(())
    }

    /// Register a result backend provider under `name`. Fails with
    /// `Duplicate` unless `override_` is set.
    pub async fn register_result_backend(
        &self,
        name: &str,
        provider: Arc<dyn ResultBackend>,
        override_: bool,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.result_backends.contains_key(name) && !override_ {
            return Err(NuvomError::duplicate(CAP_RESULT_BACKEND, name));
        }
        debug!(capability = CAP_RESULT_BACKEND, name, "registering capability provider");
        inner.result_backends.insert(name.to_string(), provider);
        Ok(())
    }

    /// Resolve a queue backend. If `name` is `None` and exactly one
    /// provider is registered, returns it; otherwise `Ambiguous`.
    pub async fn get_queue_backend(&self, name: Option<&str>) -> Result<Arc<dyn QueueBackend>> {
        let inner = self.inner.read().await;
        resolve(CAP_QUEUE_BACKEND, &inner.queue_backends, name).cloned()
    }

    /// Resolve a result backend. If `name` is `None` and exactly one
    /// provider is registered, returns it; otherwise `Ambiguous`.
    pub async fn get_result_backend(&self, name: Option<&str>) -> Result<Arc<dyn ResultBackend>> {
        let inner = self.inner.read().await;
        resolve(CAP_RESULT_BACKEND, &inner.result_backends, name).cloned()
    }

    /// Idempotent built-in registration, guarded against re-entrancy.
    /// Wires the memory/file/sqlite queue and result backends using the
    /// directories/paths named in `config`.
    pub async fn ensure_builtins(&self, config: &Config) -> Result<()> {
        {
            let inner = self.inner.read().await;
            if inner.builtins_done {
                return Ok(());
            }
        }
        let mut inner = self.inner.write().await;
        if inner.builtins_done {
            return Ok(());
        }
        inner.builtins_done = true;
        drop(inner);

        info!("registering built-in capability providers");

        let memory_queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(config.queue_maxsize));
        self.register_queue_backend("memory", memory_queue, false).await?;

        let file_queue: Arc<dyn QueueBackend> = Arc::new(FileQueue::new(&config.queue_dir).await?);
        self.register_queue_backend("file", file_queue, false).await?;

        let memory_result: Arc<dyn ResultBackend> = Arc::new(MemoryResultBackend::new());
        self.register_result_backend("memory", memory_result, false).await?;

        let file_result: Arc<dyn ResultBackend> = Arc::new(FileResultBackend::new(&config.result_dir).await?);
        self.register_result_backend("file", file_result, false).await?;

        let sqlite_result: Arc<dyn ResultBackend> = Arc::new(SqliteResultBackend::new(&config.sqlite_db_path).await?);
        self.register_result_backend("sqlite", sqlite_result, false).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn register_and_get_by_name() {
        let registry = CapabilityRegistry::new();
        let q: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        registry.register_queue_backend("memory", q, false).await.unwrap();
        assert!(registry.get_queue_backend(Some("memory")).await.is_ok());
    }

    #[tokio::test]
    async fn duplicate_without_override_fails() {
        let registry = CapabilityRegistry::new();
        let q1: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        let q2: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        registry.register_queue_backend("memory", q1, false).await.unwrap();
        let err = registry.register_queue_backend("memory", q2, false).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn override_replaces_existing() {
        let registry = CapabilityRegistry::new();
        let q1: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        let q2: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        registry.register_queue_backend("memory", q1, false).await.unwrap();
        registry.register_queue_backend("memory", q2, true).await.unwrap();
    }

    #[tokio::test]
    async fn sole_provider_resolves_without_name() {
        let registry = CapabilityRegistry::new();
        let q: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        registry.register_queue_backend("memory", q, false).await.unwrap();
        assert!(registry.get_queue_backend(None).await.is_ok());
    }

    #[tokio::test]
    async fn ambiguous_without_name_when_multiple() {
        let registry = CapabilityRegistry::new();
        let q1: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        let q2: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        registry.register_queue_backend("memory", q1, false).await.unwrap();
        registry.register_queue_backend("file", q2, false).await.unwrap();
        assert!(registry.get_queue_backend(None).await.is_err());
    }
}
