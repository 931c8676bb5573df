//! File-backed result backend.
//!
//! Grounded on `original_source/nuvom/result_backends/file_backend.py`: one
//! file per job under a results directory. Unlike the original (which
//! splits `.result`/`.error` files and stores only the bare value), this
//! stores the full [`ResultRecord`] per file so `get_full`/`list_jobs` have
//! complete metadata, matching `spec.md` §4.3's unified contract.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::codec::{self, CodecKind};
use crate::codec::Value;
use crate::error::Result;

use super::{ResultBackend, ResultRecord};

pub struct FileResultBackend {
    dir: PathBuf,
    codec: CodecKind,
}

impl FileResultBackend {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            codec: CodecKind::MsgPack,
        })
    }

    fn path(&self, job_id: &str) -> PathBuf {
        self.dir.join(format!("{job_id}.meta"))
    }

    async fn read_record(&self, job_id: &str) -> Option<ResultRecord> {
        let bytes = tokio::fs::read(self.path(job_id)).await.ok()?;
        codec::decode::<ResultRecord>(self.codec, &bytes).ok()
    }

    async fn write_record(&self, mut record: ResultRecord) -> Result<()> {
        if let Some(existing) = self.read_record(&record.job_id).await {
            record.created_at = existing.created_at;
        }
        let bytes = codec::encode(self.codec, &record)?;
        tokio::fs::write(self.path(&record.job_id), bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ResultBackend for FileResultBackend {
    async fn set_result(&self, record: ResultRecord) -> Result<()> {
        self.write_record(record).await
    }

    async fn get_result(&self, job_id: &str) -> Result<Option<Value>> {
        Ok(self
            .read_record(job_id)
            .await
            .filter(|r| matches!(r.status, crate::job::JobStatus::Success))
            .and_then(|r| r.result))
    }

    async fn set_error(&self, record: ResultRecord) -> Result<()> {
        self.write_record(record).await
    }

    async fn get_error(&self, job_id: &str) -> Result<Option<String>> {
        Ok(self
            .read_record(job_id)
            .await
            .filter(|r| matches!(r.status, crate::job::JobStatus::Failed))
            .and_then(|r| r.error)
            .map(|e| e.message))
    }

    async fn get_full(&self, job_id: &str) -> Result<Option<ResultRecord>> {
        Ok(self.read_record(job_id).await)
    }

    async fn list_jobs(&self) -> Result<Vec<ResultRecord>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                if let Ok(record) = codec::decode::<ResultRecord>(self.codec, &bytes) {
                    records.push(record);
                }
            }
        }
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_result_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileResultBackend::new(dir.path()).await.unwrap();
        backend
            .set_result(ResultRecord::success("j1", "add", Some(Value::Int(5))))
            .await
            .unwrap();
        assert_eq!(backend.get_result("j1").await.unwrap(), Some(Value::Int(5)));
    }

    #[tokio::test]
    async fn overwrite_preserves_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileResultBackend::new(dir.path()).await.unwrap();
        let first = ResultRecord::success("j1", "add", Some(Value::Int(1)));
        let ts = first.created_at;
        backend.set_result(first).await.unwrap();
        backend
            .set_result(ResultRecord::success("j1", "add", Some(Value::Int(2))))
            .await
            .unwrap();
        let full = backend.get_full("j1").await.unwrap().unwrap();
        assert_eq!(full.created_at, ts);
    }
}
