//! In-memory queue backend.
//!
//! Grounded on `original_source/nuvom/queue_backends/memory_queue.py`'s
//! `MemoryJobQueue`: a FIFO protected by a mutex and a "not empty"
//! condition. `spec.md` §4.2 notes serialization is logically applied here
//! but may be a no-op in-process; we still round-trip through the codec so
//! the FIFO behaves identically to the file backend under corruption
//! testing, at the cost of a clone.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::codec::{self, CodecKind};
use crate::error::Result;
use crate::job::Job;

use super::QueueBackend;

struct Inner {
    items: VecDeque<Vec<u8>>,
}

/// Bounded/unbounded in-memory FIFO. `maxsize == 0` means unbounded.
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    not_empty: Notify,
    maxsize: usize,
    codec: CodecKind,
}

impl MemoryQueue {
    pub fn new(maxsize: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
            }),
            not_empty: Notify::new(),
            maxsize,
            codec: CodecKind::MsgPack,
        }
    }

    pub fn with_codec(mut self, codec: CodecKind) -> Self {
        self.codec = codec;
        self
    }
}

#[async_trait]
impl QueueBackend for MemoryQueue {
    async fn enqueue(&self, job: Job) -> Result<()> {
        let bytes = codec::encode(self.codec, &job)?;
        let mut inner = self.inner.lock().await;
        if self.maxsize > 0 {
            while inner.items.len() >= self.maxsize {
                // Unbounded wait would deadlock a single-threaded caller;
                // spec treats queues as effectively unbounded by default,
                // so a configured maxsize simply backpressures here.
                drop(inner);
                tokio::task::yield_now().await;
                inner = self.inner.lock().await;
            }
        }
        inner.items.push_back(bytes);
        drop(inner);
        self.not_empty.notify_one();
        Ok(())
    }

    async fn dequeue(&self, timeout: Duration) -> Result<Option<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(bytes) = inner.items.pop_front() {
                    let job: Job = codec::decode(self.codec, &bytes)?;
                    return Ok(Some(job));
                }
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::select! {
                _ = self.not_empty.notified() => {}
                _ = tokio::time::sleep(remaining) => return Ok(None),
            }
        }
    }

    async fn pop_batch(&self, batch_size: usize, timeout: Duration) -> Result<Vec<Job>> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut batch = Vec::with_capacity(batch_size);

        // Atomic w.r.t. enqueuers: drain everything currently available
        // under a single lock acquisition first.
        {
            let mut inner = self.inner.lock().await;
            while batch.len() < batch_size {
                match inner.items.pop_front() {
                    Some(bytes) => batch.push(codec::decode::<Job>(self.codec, &bytes)?),
                    None => break,
                }
            }
        }

        while batch.len() < batch_size {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::select! {
                _ = self.not_empty.notified() => {
                    let mut inner = self.inner.lock().await;
                    while batch.len() < batch_size {
                        match inner.items.pop_front() {
                            Some(bytes) => batch.push(codec::decode::<Job>(self.codec, &bytes)?),
                            None => break,
                        }
                    }
                }
                _ = tokio::time::sleep(remaining) => break,
            }
        }

        Ok(batch)
    }

    async fn qsize(&self) -> Result<usize> {
        Ok(self.inner.lock().await.items.len())
    }

    async fn clear(&self) -> Result<()> {
        self.inner.lock().await.items.clear();
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
    async fn fifo_enqueue_dequeue_preserves_order() {
        let q = MemoryQueue::new(0);
        for n in ["j1", "j2", "j3"] {
            q.enqueue(job(n)).await.unwrap();
        }
        let mut order = vec![];
        while let Some(j) = q.dequeue(Duration::from_millis(10)).await.unwrap() {
            order.push(j.func_name);
        }
        assert_eq!(order, vec!["j1", "j2", "j3"]);
    }

    #[tokio::test]
    async fn dequeue_on_empty_times_out_to_none() {
        let q = MemoryQueue::new(0);
        let result = q.dequeue(Duration::from_millis(20)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn pop_batch_returns_partial_when_queue_runs_dry() {
        let q = MemoryQueue::new(0);
        q.enqueue(job("a")).await.unwrap();
        q.enqueue(job("b")).await.unwrap();
        let batch = q.pop_batch(5, Duration::from_millis(20)).await.unwrap();
        assert_eq!(batch.len(), 2);
    }

    #[tokio::test]
    async fn qsize_and_clear() {
        let q = MemoryQueue::new(0);
        q.enqueue(job("a")).await.unwrap();
        q.enqueue(job("b")).await.unwrap();
        assert_eq!(q.qsize().await.unwrap(), 2);
        q.clear().await.unwrap();
        assert_eq!(q.qsize().await.unwrap(), 0);
    }
}
