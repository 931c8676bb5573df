//! End-to-end coverage for the file-backed queue under concurrent
//! consumers: a larger-scale counterpart to `queue::file`'s unit tests,
//! run against the crate's public API only.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use nuvom_core::job::Job;
use nuvom_core::queue::file::FileQueue;
use nuvom_core::queue::QueueBackend;

const JOB_COUNT: usize = 1000;
const CONSUMER_COUNT: usize = 8;
const BATCH_SIZE: usize = 16;

#[tokio::test]
async fn many_consumers_partition_the_enqueued_set_with_no_overlap() {
    let dir = tempfile::tempdir().unwrap();
    let queue = Arc::new(FileQueue::new(dir.path()).await.unwrap());

    let mut enqueued = HashSet::new();
    for i in 0..JOB_COUNT {
        let job = Job::new(format!("job-{i}"), Vec::new(), Default::default());
        enqueued.insert(job.id);
        queue.enqueue(job).await.unwrap();
    }
    assert_eq!(queue.qsize().await.unwrap(), JOB_COUNT);

    let mut handles = Vec::with_capacity(CONSUMER_COUNT);
    for _ in 0..CONSUMER_COUNT {
        let queue = queue.clone();
        handles.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = queue.pop_batch(BATCH_SIZE, Duration::from_millis(200)).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                claimed.extend(batch);
            }
            claimed
        }));
    }

    let mut per_consumer = Vec::with_capacity(CONSUMER_COUNT);
    for h in handles {
        per_consumer.push(h.await.unwrap());
    }

    // no two consumers ever claimed the same job
    for i in 0..per_consumer.len() {
        for j in (i + 1)..per_consumer.len() {
            let a: HashSet<_> = per_consumer[i].iter().map(|j| j.id).collect();
            let b: HashSet<_> = per_consumer[j].iter().map(|j| j.id).collect();
            assert!(a.is_disjoint(&b), "consumers {i} and {j} both claimed a job");
        }
    }

    // the union of everything claimed equals everything enqueued
    let union: HashSet<_> = per_consumer.iter().flatten().map(|j| j.id).collect();
    assert_eq!(union, enqueued);
    assert_eq!(queue.qsize().await.unwrap(), 0);
}
