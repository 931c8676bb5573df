//! File-backed queue backend.
//!
//! Grounded directly on `original_source/nuvom/queue_backends/file_queue.py`:
//! one file per job, named `<enqueue_timestamp>_<job_id>.<ext>` for a
//! sortable lexical order; atomic claim via POSIX rename to
//! `<path>.claimed.<uuid>`; undecodable claims are quarantined to
//! `<path>.corrupt` rather than dropped.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

use crate::codec::{self, CodecKind};
use crate::error::Result;
use crate::job::Job;

use super::QueueBackend;

const CLAIM_RETRIES: u32 = 5;
const CLAIM_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct FileQueue {
    dir: PathBuf,
    lock: Mutex<()>,
    codec: CodecKind,
}

impl FileQueue {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            lock: Mutex::new(()),
            codec: CodecKind::MsgPack,
        })
    }

    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }

    fn job_path(&self, job: &Job) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        self.dir
            .join(format!("{:.6}_{}.{}", ts, job.id, self.codec.ext()))
    }

    /// Rename `path` to a claimed sibling, retrying briefly on permission
    /// errors and giving up silently (another consumer won the race) on
    /// not-found.
    async fn claim_file(&self, path: &Path) -> Option<PathBuf> {
        let claimed = path.with_file_name(format!(
            "{}.claimed.{}",
            path.file_name()?.to_string_lossy(),
            Uuid::new_v4().simple()
        ));
        for _ in 0..CLAIM_RETRIES {
            if tokio::fs::metadata(path).await.is_err() {
                continue;
            }
            match tokio::fs::rename(path, &claimed).await {
                Ok(()) => return Some(claimed),
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    tokio::time::sleep(CLAIM_RETRY_DELAY).await;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(_) => continue,
            }
        }
        error!(path = %path.display(), "failed to claim queue file");
        None
    }

    /// Load and decode a claimed file, removing it on success and
    /// quarantining it to `.corrupt` on decode failure.
    async fn take_claimed(&self, claimed: PathBuf) -> Option<Job> {
        let bytes = match tokio::fs::read(&claimed).await {
            Ok(b) => b,
            Err(_) => return None,
        };
        match codec::decode::<Job>(self.codec, &bytes) {
            Ok(job) => {
                let _ = tokio::fs::remove_file(&claimed).await;
                Some(job)
            }
            Err(e) => {
                e.log();
                let corrupt = PathBuf::from(format!("{}.corrupt", claimed.display()));
                if tokio::fs::rename(&claimed, &corrupt).await.is_err() {
                    let _ = tokio::fs::remove_file(&claimed).await;
                }
                None
            }
        }
    }

    async fn sorted_entries(&self) -> Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.path());
        }
        names.sort();
        Ok(names)
    }

    fn is_claimable(path: &Path) -> bool {
        let name = path.to_string_lossy();
        !name.ends_with(".corrupt") && !name.contains(".claimed.")
    }

    /// Remove leftover `.corrupt`/`.claimed.*` files left behind by a crash.
    pub async fn cleanup(&self) -> Result<()> {
        for path in self.sorted_entries().await? {
            let name = path.to_string_lossy();
            if name.ends_with(".corrupt") || name.contains(".claimed") {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl QueueBackend for FileQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let bytes = codec::encode(self.codec, &job)?;
        let path = self.job_path(&job);
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let _guard = self.lock.lock().await;
                for path in self.sorted_entries().await? {
                    if !Self::is_claimable(&path) {
                        continue;
                    }
                    if let Some(claimed) = self.claim_file(&path).await {
                        if let Some(job) = self.take_claimed(claimed).await {
                            return Ok(Some(job));
                        }
                    }
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(20).min(timeout)).await;
        }
    }

    async fn pop_batch(&self, batch_size: usize, timeout: Duration) -> Result<Vec<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut jobs = Vec::with_capacity(batch_size);
        loop {
            {
                let _guard = self.lock.lock().await;
                for path in self.sorted_entries().await? {
                    if jobs.len() >= batch_size {
                        break;
                    }
                    if !Self::is_claimable(&path) {
                        continue;
                    }
                    if let Some(claimed) = self.claim_file(&path).await {
                        if let Some(job) = self.take_claimed(claimed).await {
                            jobs.push(job);
                        }
                    }
                }
            }
            if jobs.len() >= batch_size || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20).min(timeout)).await;
        }
        Ok(jobs)
    }

    async fn qsize(&self) -> Result<usize> {
        Ok(self.sorted_entries().await?.len())
    }

    async fn clear(&self) -> Result<()> {
        for path in self.sorted_entries().await? {
            let _ = tokio::fs::remove_file(&path).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn job(name: &str) -> Job {
        Job::new(name, vec![], BTreeMap::new())
    }

    #[tokio::test]
    async fn enqueue_dequeue_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path()).await.unwrap();
        q.enqueue(job("add")).await.unwrap();
        assert_eq!(q.qsize().await.unwrap(), 1);
        let got = q.dequeue(Duration::from_millis(200)).await.unwrap().unwrap();
        assert_eq!(got.func_name, "add");
        assert_eq!(q.qsize().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn corrupt_file_is_quarantined_not_lost() {
        let dir = tempfile::tempdir().unwrap();
        let q = FileQueue::new(dir.path()).await.unwrap();
        tokio::fs::write(dir.path().join("0.000001_bad.msgpack"), b"not msgpack")
            .await
            .unwrap();
        let got = q.dequeue(Duration::from_millis(200)).await.unwrap();
        assert!(got.is_none());
        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut saw_corrupt = false;
        while let Some(e) = entries.next_entry().await.unwrap() {
            if e.file_name().to_string_lossy().ends_with(".corrupt") {
                saw_corrupt = true;
            }
        }
        assert!(saw_corrupt);
    }

    #[tokio::test]
    async fn concurrent_consumers_never_double_claim() {
        let dir = tempfile::tempdir().unwrap();
        let q = std::sync::Arc::new(FileQueue::new(dir.path()).await.unwrap());
        for i in 0..20 {
            q.enqueue(job(&format!("job{i}"))).await.unwrap();
        }
        let mut handles = vec![];
        for _ in 0..4 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                q.pop_batch(10, Duration::from_millis(300)).await.unwrap()
            }));
        }
        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for h in handles {
            for job in h.await.unwrap() {
                assert!(seen.insert(job.id));
                total += 1;
            }
        }
        assert_eq!(total, 20);
    }
}
