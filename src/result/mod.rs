//! Result backend contract (`spec.md` §4.3).
//!
//! A durable key→record store of terminal job metadata. Write semantics are
//! upsert keyed by `job_id`: subsequent writes overwrite status and the
//! status-specific payload, preserving `created_at` from the first write
//! when available. Grounded on
//! `original_source/nuvom/result_backends/{memory,file,sqlite}_backend.py`.

pub mod file;
pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::codec::Value;
use crate::error::{JobErrorDetail, Result};
use crate::job::JobStatus;

/// The durable record of one job's terminal outcome, plus the input
/// metadata useful for `inspect`/`history` (`spec.md` §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRecord {
    pub job_id: String,
    pub func_name: String,
    pub status: JobStatus,
    pub result: Option<Value>,
    pub error: Option<JobErrorDetail>,
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
    pub retries_left: Option<u32>,
    pub attempts: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl ResultRecord {
    pub fn success(job_id: impl Into<String>, func_name: impl Into<String>, result: Option<Value>) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            func_name: func_name.into(),
            status: JobStatus::Success,
            result,
            error: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            retries_left: None,
            attempts: None,
            created_at: now,
            completed_at: now,
        }
    }

    pub fn failure(job_id: impl Into<String>, func_name: impl Into<String>, error: JobErrorDetail) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            func_name: func_name.into(),
            status: JobStatus::Failed,
            result: None,
            error: Some(error),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            retries_left: None,
            attempts: None,
            created_at: now,
            completed_at: now,
        }
    }

    pub fn with_inputs(mut self, args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        self.args = args;
        self.kwargs = kwargs;
        self
    }

    pub fn with_counts(mut self, retries_left: u32, attempts: u32) -> Self {
        self.retries_left = Some(retries_left);
        self.attempts = Some(attempts);
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Durable key→record store of terminal job outcomes.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Upsert a successful-outcome record, keyed by `job_id`.
    async fn set_result(&self, record: ResultRecord) -> Result<()>;

    /// The decoded result value, or `None` if the job isn't recorded as
    /// SUCCESS.
    async fn get_result(&self, job_id: &str) -> Result<Option<Value>>;

    /// Upsert a failed-outcome record, keyed by `job_id`.
    async fn set_error(&self, record: ResultRecord) -> Result<()>;

    /// The error message, or `None` if the job isn't recorded as FAILED.
    async fn get_error(&self, job_id: &str) -> Result<Option<String>>;

    /// The full record for a job, regardless of outcome.
    async fn get_full(&self, job_id: &str) -> Result<Option<ResultRecord>>;

    /// All records, newest first.
    async fn list_jobs(&self) -> Result<Vec<ResultRecord>>;
}
