//! Job Runner: executes exactly one job, classifies outcomes, persists
//! terminal results (`spec.md` §4.4).
//!
//! Grounded on `original_source/nuvom/execution/job_runner.py`'s
//! `JobRunner.run`/`_handle_failure`, generalized to the registry-dispatch
//! task model and the explicit `timeout_policy` branching `spec.md` §4.4
//! step 5 calls for (the Python snapshot only ever treats timeout as a
//! plain failure; the policy enum is this port's faithful implementation
//! of what the spec text directs).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::codec::Value;
use crate::error::JobErrorDetail;
use crate::job::{Job, JobContext, JobStatus, TimeoutPolicy};
use crate::queue::QueueBackend;
use crate::result::{ResultBackend, ResultRecord};
use crate::task::TaskRegistry;

/// The terminal disposition of one `run()` call.
#[derive(Debug)]
pub enum RunOutcome {
    Success(Job),
    Failed(Job),
    /// Re-enqueued for a future retry; not a terminal persistence.
    Requeued(Job),
}

pub struct JobRunner {
    pub tasks: TaskRegistry,
    pub queue: Arc<dyn QueueBackend>,
    pub results: Arc<dyn ResultBackend>,
    pub worker_id: usize,
    pub default_timeout_secs: u64,
}

impl JobRunner {
    pub fn new(
        tasks: TaskRegistry,
        queue: Arc<dyn QueueBackend>,
        results: Arc<dyn ResultBackend>,
        worker_id: usize,
        default_timeout_secs: u64,
    ) -> Self {
        Self {
            tasks,
            queue,
            results,
            worker_id,
            default_timeout_secs,
        }
    }

    fn run_hook<F: FnOnce() -> crate::job::HookResult>(&self, hook_name: &str, f: F) {
        if let Err(reason) = f() {
            crate::error::NuvomError::hook_failure(hook_name, reason).log();
        }
    }

    /// Run one job to a terminal disposition, per `spec.md` §4.4's
    /// algorithm. Equivalent to [`Self::run_cancellable`] with a
    /// cancellation channel that never fires.
    pub async fn run(&self, job: Job) -> RunOutcome {
        self.run_cancellable(job, watch_never_cancelled()).await
    }

    /// Run one job to a terminal disposition, observing `cancellation` for
    /// cooperative cancel signals surfaced to the task body through
    /// [`JobContext::is_cancelled`]. The worker mailbox loop wires a live
    /// channel here; [`Self::run`] is the no-cancellation convenience form.
    pub async fn run_cancellable(&self, mut job: Job, cancellation: tokio::sync::watch::Receiver<bool>) -> RunOutcome {
        job.mark_running();

        let Some(task) = self.tasks.get(&job.func_name).await else {
            // TaskNotRegistered fails the job permanently; no retry,
            // regardless of retries_left (spec.md §7).
            let err = crate::error::NuvomError::task_not_registered(&job.func_name);
            err.log();
            return self
                .terminal_failure(job, err.user_message.to_string(), "TaskNotRegistered".to_string())
                .await;
        };

        if let Some(hook) = &job.before_job {
            let hook = hook.clone();
            self.run_hook("before_job", || hook());
        }

        let timeout_secs = job.timeout_secs.unwrap_or(self.default_timeout_secs);
        let deadline = Duration::from_secs(timeout_secs);

        let invocable = task.invocable.clone();
        let args = job.args.clone();
        let kwargs = job.kwargs.clone();
        let ctx = JobContext::new(job.id, job.func_name.clone(), job.attempts, cancellation);

        let handle = tokio::task::spawn_blocking(move || invocable(&args, &kwargs, &ctx));

        match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(Ok(result))) => self.on_completed(job, result).await,
            Ok(Ok(Err(job_err))) => self.on_exception(job, job_err.message.clone(), job_err.code.map(str::to_string)).await,
            Ok(Err(join_err)) => self.on_exception(job, format!("task panicked: {join_err}"), None).await,
            Err(_elapsed) => self.on_timeout(job).await,
        }
    }

    async fn on_completed(&self, mut job: Job, result: Value) -> RunOutcome {
        if let Some(hook) = &job.after_job {
            let hook = hook.clone();
            let result = result.clone();
            self.run_hook("after_job", || hook(&result));
        }

        job.mark_success(Some(result));

        if job.store_result {
            self.persist_success(&job).await;
        }

        info!(job_id = %job.id, func_name = %job.func_name, attempts = job.attempts, "job succeeded");
        RunOutcome::Success(job)
    }

    async fn on_timeout(&self, job: Job) -> RunOutcome {
        match job.timeout_policy {
            // `fail` is terminal regardless of retries_left; only `retry`
            // goes through ordinary retry evaluation (spec.md §7: "for
            // timeout_policy = fail ... yields terminal failure"; "for
            // retry, it is re-enqueued").
            TimeoutPolicy::Fail => {
                self.terminal_failure(job, "job execution timed out".to_string(), "Timeout".to_string())
                    .await
            }
            TimeoutPolicy::Retry => {
                self.fail_or_retry(job, "job execution timed out".to_string(), Some("Timeout".into()))
                    .await
            }
            TimeoutPolicy::Ignore => {
                let mut job = job;
                job.mark_success(None);
                if job.store_result {
                    self.persist_success(&job).await;
                }
                warn!(job_id = %job.id, "timeout ignored per timeout_policy, marked SUCCESS with no result");
                RunOutcome::Success(job)
            }
        }
    }

    async fn on_exception(&self, job: Job, message: String, error_type: Option<String>) -> RunOutcome {
        self.fail_or_retry(job, message, error_type).await
    }

    /// Terminal failure that never consults `retries_left`: used for
    /// `TaskNotRegistered` and `timeout_policy = fail`, both of which end
    /// the job outright regardless of retries remaining.
    async fn terminal_failure(&self, mut job: Job, message: String, error_type: String) -> RunOutcome {
        job.mark_failed(JobErrorDetail {
            r#type: error_type,
            message,
            traceback: None,
        });
        if job.store_result {
            self.persist_failure(&job).await;
        }
        warn!(job_id = %job.id, func_name = %job.func_name, "job failed permanently");
        RunOutcome::Failed(job)
    }

    /// Shared terminal-failure/retry path for both timeouts classified as
    /// `fail`/`retry` and ordinary task exceptions (`spec.md` §4.4 step 6).
    async fn fail_or_retry(&self, mut job: Job, message: String, error_type: Option<String>) -> RunOutcome {
        let detail = JobErrorDetail {
            r#type: error_type.unwrap_or_else(|| "UserException".into()),
            message,
            traceback: None,
        };

        if let Some(hook) = &job.on_error {
            let hook = hook.clone();
            let detail_ref = detail.clone();
            self.run_hook("on_error", || hook(&detail_ref));
        }

        job.mark_failed(detail);

        if job.try_consume_retry() {
            let delay = job.retry_delay_secs.unwrap_or(0);
            job.next_retry_at = Some(Utc::now() + chrono::Duration::seconds(delay as i64));
            job.status = JobStatus::Pending;
            info!(
                job_id = %job.id,
                func_name = %job.func_name,
                attempt = job.attempts,
                "retrying job"
            );
            if let Err(e) = self.queue.enqueue(job.clone()).await {
                e.log();
            }
            RunOutcome::Requeued(job)
        } else {
            if job.store_result {
                self.persist_failure(&job).await;
            }
            warn!(
                job_id = %job.id,
                func_name = %job.func_name,
                max_retries = job.max_retries,
                "job failed permanently"
            );
            RunOutcome::Failed(job)
        }
    }

    async fn persist_success(&self, job: &Job) {
        let record = ResultRecord::success(job.id.to_string(), job.func_name.clone(), job.result.clone())
            .with_inputs(job.args.clone(), job.kwargs.clone())
            .with_counts(job.retries_left, job.attempts)
            .with_created_at(job.created_at);
        if let Err(e) = self.results.set_result(record).await {
            e.log();
        }
    }

    async fn persist_failure(&self, job: &Job) {
        let detail = job.error.clone().unwrap_or(JobErrorDetail {
            r#type: "Unknown".into(),
            message: "no error detail recorded".into(),
            traceback: None,
        });
        let record = ResultRecord::failure(job.id.to_string(), job.func_name.clone(), detail)
            .with_inputs(job.args.clone(), job.kwargs.clone())
            .with_counts(job.retries_left, job.attempts)
            .with_created_at(job.created_at);
        if let Err(e) = self.results.set_error(record).await {
            e.log();
        }
    }
}

/// A cancellation channel that never fires, for contexts constructed
/// without a real cooperative-cancel signal (the worker mailbox wires a
/// live one; see `orchestrator/worker.rs`).
fn watch_never_cancelled() -> tokio::sync::watch::Receiver<bool> {
    let (_tx, rx) = tokio::sync::watch::channel(false);
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::memory::MemoryQueue;
    use crate::result::memory::MemoryResultBackend;
    use crate::task::{RegisterMode, Task};

    fn runner(default_timeout_secs: u64) -> (JobRunner, TaskRegistry) {
        let tasks = TaskRegistry::new();
        let queue: Arc<dyn QueueBackend> = Arc::new(MemoryQueue::new(0));
        let results: Arc<dyn ResultBackend> = Arc::new(MemoryResultBackend::new());
        (
            JobRunner::new(tasks.clone(), queue, results, 0, default_timeout_secs),
            tasks,
        )
    }

    #[tokio::test]
    async fn arithmetic_success() {
        let (runner, tasks) = runner(5);
        tasks
            .register(
                Task::new(
                    "add",
                    Arc::new(|args, _kwargs, _ctx| {
                        let (Value::Int(a), Value::Int(b)) = (&args[0], &args[1]) else {
                            unreachable!()
                        };
                        Ok(Value::Int(a + b))
                    }),
                ),
                RegisterMode::Strict,
            )
            .await
            .unwrap();

        let job = Job::new("add", vec![Value::Int(2), Value::Int(3)], BTreeMap::new());
        match runner.run(job).await {
            RunOutcome::Success(job) => {
                assert_eq!(job.result, Some(Value::Int(5)));
                assert_eq!(job.attempts, 1);
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn task_not_registered_fails_without_retry() {
        let (runner, _tasks) = runner(5);
        let job = Job::new("missing", vec![], BTreeMap::new()).with_retries(3);
        match runner.run(job).await {
            RunOutcome::Failed(job) => {
                assert_eq!(job.error.unwrap().r#type, "TaskNotRegistered");
                assert_eq!(job.retries_left, 3);
            }
            other => panic!("expected failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn permanent_failure_after_exhausting_retries() {
        let (runner, tasks) = runner(5);
        tasks
            .register(
                Task::new(
                    "divzero",
                    Arc::new(|_args, _kwargs, _ctx| {
                        Err(crate::job::JobError {
                            message: "division by zero".into(),
                            code: Some("ZeroDivisionError"),
                        })
                    }),
                ),
                RegisterMode::Strict,
            )
            .await
            .unwrap();

        let mut job = Job::new("divzero", vec![Value::Int(1)], BTreeMap::new()).with_retries(2);
        loop {
            match runner.run(job).await {
                RunOutcome::Requeued(j) => job = j,
                RunOutcome::Failed(j) => {
                    assert_eq!(j.attempts, 3);
                    assert_eq!(j.error.unwrap().r#type, "ZeroDivisionError");
                    break;
                }
                RunOutcome::Success(_) => panic!("should never succeed"),
            }
        }
    }

    #[tokio::test]
    async fn timeout_with_ignore_policy_marks_success() {
        let (runner, tasks) = runner(1);
        tasks
            .register(
                Task::new("sleepy", Arc::new(|_args, _kwargs, _ctx| {
                    std::thread::sleep(Duration::from_secs(3));
                    Ok(Value::Null)
                })),
                RegisterMode::Strict,
            )
            .await
            .unwrap();

        let job = Job::new("sleepy", vec![], BTreeMap::new())
            .with_timeout_secs(1)
            .with_timeout_policy(TimeoutPolicy::Ignore);
        match runner.run(job).await {
            RunOutcome::Success(job) => assert_eq!(job.result, None),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_with_fail_policy_is_terminal_even_with_retries_left() {
        let (runner, tasks) = runner(1);
        tasks
            .register(
                Task::new("sleepy", Arc::new(|_args, _kwargs, _ctx| {
                    std::thread::sleep(Duration::from_secs(3));
                    Ok(Value::Null)
                })),
                RegisterMode::Strict,
            )
            .await
            .unwrap();

        let job = Job::new("sleepy", vec![], BTreeMap::new())
            .with_retries(5)
            .with_timeout_secs(1)
            .with_timeout_policy(TimeoutPolicy::Fail);
        match runner.run(job).await {
            RunOutcome::Failed(job) => {
                assert_eq!(job.error.unwrap().r#type, "Timeout");
                assert_eq!(job.retries_left, 5);
            }
            other => panic!("expected failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_with_retry_policy_requeues_then_fails_per_scenario_4() {
        let (runner, tasks) = runner(1);
        tasks
            .register(
                Task::new("sleepy", Arc::new(|_args, _kwargs, _ctx| {
                    std::thread::sleep(Duration::from_secs(5));
                    Ok(Value::Null)
                })),
                RegisterMode::Strict,
            )
            .await
            .unwrap();

        let mut job = Job::new("sleepy", vec![], BTreeMap::new())
            .with_retries(1)
            .with_timeout_secs(1)
            .with_timeout_policy(TimeoutPolicy::Retry);

        match runner.run(job).await {
            RunOutcome::Requeued(j) => job = j,
            other => panic!("expected requeue, got {other:?}"),
        }
        match runner.run(job).await {
            RunOutcome::Failed(j) => {
                assert_eq!(j.attempts, 2);
                assert_eq!(j.error.unwrap().r#type, "Timeout");
            }
            other => panic!("expected terminal failure, got {other:?}"),
        }
    }
}
