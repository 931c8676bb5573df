//! In-memory result backend.
//!
//! Grounded on `original_source/nuvom/result_backends/memory_backend.py`'s
//! `MemoryResultBackend`: a process-local map keyed by `job_id`, storing
//! full outcome metadata. Volatile — lost on process restart.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::codec::Value;
use crate::error::Result;

use super::{ResultBackend, ResultRecord};

#[derive(Default)]
pub struct MemoryResultBackend {
    store: RwLock<BTreeMap<String, ResultRecord>>,
}

impl MemoryResultBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preserve `created_at` from the first write for this job id, per the
    /// upsert semantics in `spec.md` §4.3.
    fn reconcile_created_at(existing: Option<&ResultRecord>, mut incoming: ResultRecord) -> ResultRecord {
        if let Some(prev) = existing {
            incoming.created_at = prev.created_at;
        }
        incoming
    }
}

#[async_trait]
impl ResultBackend for MemoryResultBackend {
    async fn set_result(&self, record: ResultRecord) -> Result<()> {
        let mut store = self.store.write().await;
        let reconciled = Self::reconcile_created_at(store.get(&record.job_id), record);
        store.insert(reconciled.job_id.clone(), reconciled);
        Ok(())
    }

    async fn get_result(&self, job_id: &str) -> Result<Option<Value>> {
        let store = self.store.read().await;
        Ok(store
            .get(job_id)
            .filter(|r| matches!(r.status, crate::job::JobStatus::Success))
            .and_then(|r| r.result.clone()))
    }

    async fn set_error(&self, record: ResultRecord) -> Result<()> {
        let mut store = self.store.write().await;
        let reconciled = Self::reconcile_created_at(store.get(&record.job_id), record);
        store.insert(reconciled.job_id.clone(), reconciled);
        Ok(())
    }

    async fn get_error(&self, job_id: &str) -> Result<Option<String>> {
        let store = self.store.read().await;
        Ok(store
            .get(job_id)
            .filter(|r| matches!(r.status, crate::job::JobStatus::Failed))
            .and_then(|r| r.error.as_ref())
            .map(|e| e.message.clone()))
    }

    async fn get_full(&self, job_id: &str) -> Result<Option<ResultRecord>> {
        Ok(self.store.read().await.get(job_id).cloned())
    }

    async fn list_jobs(&self) -> Result<Vec<ResultRecord>> {
        let mut records: Vec<ResultRecord> = self.store.read().await.values().cloned().collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_preserves_created_at() {
        let backend = MemoryResultBackend::new();
        let first = ResultRecord::success("j1", "add", Some(Value::Int(5)));
        let original_ts = first.created_at;
        backend.set_result(first).await.unwrap();

        let second = ResultRecord::success("j1", "add", Some(Value::Int(6)));
        backend.set_result(second).await.unwrap();

        let full = backend.get_full("j1").await.unwrap().unwrap();
        assert_eq!(full.created_at, original_ts);
        assert_eq!(full.result, Some(Value::Int(6)));
    }

    #[tokio::test]
    async fn list_jobs_orders_newest_first() {
        let backend = MemoryResultBackend::new();
        backend
            .set_result(ResultRecord::success("a", "f", None))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        backend
            .set_result(ResultRecord::success("b", "f", None))
            .await
            .unwrap();
        let jobs = backend.list_jobs().await.unwrap();
        assert_eq!(jobs[0].job_id, "b");
        assert_eq!(jobs[1].job_id, "a");
    }
}
