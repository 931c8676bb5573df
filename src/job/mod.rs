//! Job value object and lifecycle hooks.
//!
//! A [`Job`] carries everything the runner needs to execute one attempt:
//! identity, target task name, arguments, retry/timeout policy, lifecycle
//! state, and hook references (`spec.md` §3, §4.7).

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::codec::Value;
use crate::error::JobErrorDetail;

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique identifier for a job instance. Preserved across retries (`spec.md`
/// §3 invariant: "retries preserve identity").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle status, exactly the four states named in `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// Timeout classification policy (`spec.md` §4.4 step 5, §6, §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TimeoutPolicy {
    /// Timeout is treated as a terminal failure.
    #[default]
    Fail,
    /// Timeout is subject to the normal retry evaluation.
    Retry,
    /// Timeout marks the job SUCCESS with no result.
    Ignore,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Backoff Strategy
// ═══════════════════════════════════════════════════════════════════════════════

/// Strategy for calculating retry delays, applied by the runner when it
/// computes `next_retry_at` for a retried job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed {
        delay_secs: u64,
    },
    Linear {
        initial_delay_secs: u64,
        increment_secs: u64,
    },
    Exponential {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
    },
    ExponentialWithJitter {
        initial_delay_secs: u64,
        max_delay_secs: u64,
        multiplier: f64,
        jitter_factor: f64,
    },
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::Fixed { delay_secs: 0 }
    }
}

impl BackoffStrategy {
    /// Delay before the given (0-indexed) retry attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let secs = match self {
            Self::Fixed { delay_secs } => *delay_secs,
            Self::Linear {
                initial_delay_secs,
                increment_secs,
            } => initial_delay_secs + increment_secs * attempt as u64,
            Self::Exponential {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
            } => {
                let delay = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                delay.min(*max_delay_secs as f64) as u64
            }
            Self::ExponentialWithJitter {
                initial_delay_secs,
                max_delay_secs,
                multiplier,
                jitter_factor,
            } => {
                let base = (*initial_delay_secs as f64) * multiplier.powi(attempt as i32);
                let capped = base.min(*max_delay_secs as f64);
                let jitter_range = capped * jitter_factor;
                let jitter = rand::thread_rng().gen_range(-1.0..=1.0) * jitter_range;
                (capped + jitter).max(0.0) as u64
            }
        };
        Duration::from_secs(secs)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

/// Hooks report failure via `Err` rather than panicking; the runner logs
/// and discards it without affecting the job's outcome (`spec.md` §4.4
/// steps 2/4/6).
pub type HookResult = std::result::Result<(), String>;
/// Error returned by a task invocable's body. Distinct from
/// [`JobErrorDetail`], which is the persisted terminal-error record the
/// runner derives from it.
#[derive(Debug, Clone)]
pub struct JobError {
    pub message: String,
    pub code: Option<&'static str>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: &'static str) -> Self {
        self.code = Some(code);
        self
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for JobError {}

pub type BeforeHook = Arc<dyn Fn() -> HookResult + Send + Sync>;
pub type AfterHook = Arc<dyn Fn(&Value) -> HookResult + Send + Sync>;
pub type OnErrorHook = Arc<dyn Fn(&JobErrorDetail) -> HookResult + Send + Sync>;

/// A single execution request: identity, target task, arguments, policy,
/// lifecycle state, and hook references. See `spec.md` §3's Job row.
#[derive(Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub func_name: String,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,

    pub retries_left: u32,
    pub max_retries: u32,
    pub attempts: u32,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,

    pub timeout_secs: Option<u64>,
    pub retry_delay_secs: Option<u64>,
    pub timeout_policy: TimeoutPolicy,
    pub next_retry_at: Option<DateTime<Utc>>,

    pub store_result: bool,
    pub result: Option<Value>,
    pub error: Option<JobErrorDetail>,

    /// Hooks are process-local closures, never carried across serialization
    /// (matching `original_source/nuvom/job.py`'s `to_dict()`, which only
    /// records whether a hook was present, not the hook itself).
    #[serde(skip)]
    pub before_job: Option<BeforeHook>,
    #[serde(skip)]
    pub after_job: Option<AfterHook>,
    #[serde(skip)]
    pub on_error: Option<OnErrorHook>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("func_name", &self.func_name)
            .field("status", &self.status)
            .field("attempts", &self.attempts)
            .field("retries_left", &self.retries_left)
            .finish()
    }
}

impl Job {
    pub fn new(func_name: impl Into<String>, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self {
            id: JobId::new(),
            func_name: func_name.into(),
            args,
            kwargs,
            retries_left: 0,
            max_retries: 0,
            attempts: 0,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            timeout_secs: None,
            retry_delay_secs: None,
            timeout_policy: TimeoutPolicy::default(),
            next_retry_at: None,
            store_result: true,
            result: None,
            error: None,
            before_job: None,
            after_job: None,
            on_error: None,
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries_left = retries;
        self.max_retries = retries;
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_retry_delay_secs(mut self, secs: u64) -> Self {
        self.retry_delay_secs = Some(secs);
        self
    }

    pub fn with_store_result(mut self, store: bool) -> Self {
        self.store_result = store;
        self
    }

    /// Attempts counter increments monotonically on each run start
    /// (`spec.md` §4.4 invariant); `retries_left` is untouched here and only
    /// decremented on failure (see §4.4's Open Question resolution).
    pub fn mark_running(&mut self) {
        self.status = JobStatus::Running;
        self.attempts += 1;
    }

    pub fn mark_success(&mut self, result: Option<Value>) {
        self.status = JobStatus::Success;
        self.result = result;
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: JobErrorDetail) {
        self.status = JobStatus::Failed;
        self.error = Some(error);
    }

    /// Grants a retry if one remains, consuming it. `retries_left` is only
    /// decremented when a retry is actually taken, so an always-failing job
    /// with `max_retries = R` runs exactly `R + 1` times before this
    /// returns `false` (`spec.md` §4.4 Open Question resolution).
    pub fn try_consume_retry(&mut self) -> bool {
        if self.retries_left > 0 {
            self.retries_left -= 1;
            true
        } else {
            false
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context available to a task invocable while it runs, and to lifecycle
/// hooks.
pub struct JobContext {
    pub job_id: JobId,
    pub func_name: String,
    pub attempt: u32,
    cancellation: tokio::sync::watch::Receiver<bool>,
    progress_sender: Option<tokio::sync::mpsc::Sender<JobProgress>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub job_id: JobId,
    pub percent: u8,
    pub message: Option<String>,
}

impl JobContext {
    pub fn new(job_id: JobId, func_name: impl Into<String>, attempt: u32, cancellation: tokio::sync::watch::Receiver<bool>) -> Self {
        Self {
            job_id,
            func_name: func_name.into(),
            attempt,
            cancellation,
            progress_sender: None,
        }
    }

    pub fn with_progress_sender(mut self, sender: tokio::sync::mpsc::Sender<JobProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancellation.borrow()
    }

    pub async fn report_progress(&self, percent: u8, message: Option<String>) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender
                .send(JobProgress {
                    job_id: self.job_id,
                    percent: percent.min(100),
                    message,
                })
                .await;
        }
    }

    pub fn log_info(&self, message: &str) {
        tracing::info!(job_id = %self.job_id, func_name = %self.func_name, attempt = self.attempt, "{message}");
    }

    pub fn log_warn(&self, message: &str) {
        tracing::warn!(job_id = %self.job_id, func_name = %self.func_name, attempt = self.attempt, "{message}");
    }

    pub fn log_error(&self, message: &str) {
        tracing::error!(job_id = %self.job_id, func_name = %self.func_name, attempt = self.attempt, "{message}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }

    #[test]
    fn status_terminality() {
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn backoff_fixed() {
        let b = BackoffStrategy::Fixed { delay_secs: 10 };
        assert_eq!(b.delay_for_attempt(0), Duration::from_secs(10));
        assert_eq!(b.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn backoff_exponential_caps() {
        let b = BackoffStrategy::Exponential {
            initial_delay_secs: 1,
            max_delay_secs: 100,
            multiplier: 2.0,
        };
        assert_eq!(b.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(b.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(b.delay_for_attempt(10), Duration::from_secs(100));
    }

    #[test]
    fn mark_running_increments_attempts_not_retries_left() {
        let mut job = Job::new("add", vec![], BTreeMap::new()).with_retries(2);
        job.mark_running();
        assert_eq!(job.attempts, 1);
        assert_eq!(job.retries_left, 2);
    }

    #[test]
    fn mark_failed_then_consume_retry_decrements_retries_left() {
        let mut job = Job::new("add", vec![], BTreeMap::new()).with_retries(2);
        job.mark_running();
        job.mark_failed(JobErrorDetail {
            r#type: "ValueError".into(),
            message: "boom".into(),
            traceback: None,
        });
        assert!(job.try_consume_retry());
        assert_eq!(job.retries_left, 1);
    }

    #[test]
    fn retry_bound_produces_attempts_equal_max_retries_plus_one() {
        let mut job = Job::new("divzero", vec![], BTreeMap::new()).with_retries(2);
        let mut retried = true;
        let mut iterations = 0;
        while retried {
            job.mark_running();
            iterations += 1;
            job.mark_failed(JobErrorDetail {
                r#type: "ZeroDivisionError".into(),
                message: "division by zero".into(),
                traceback: None,
            });
            retried = job.try_consume_retry();
            assert!(iterations <= 3, "retry loop should terminate within max_retries + 1 attempts");
        }
        assert_eq!(job.attempts, 3);
        assert_eq!(job.retries_left, 0);
    }
}
