//! SQLite-backed result backend.
//!
//! Grounded on `original_source/nuvom/result_backends/sqlite_backend.py`'s
//! `SQLiteResultBackend`: a single `jobs` table, WAL mode, one connection
//! pool shared across worker tasks (the original uses one connection per
//! thread; `sqlx`'s pool is the async-idiomatic equivalent), durable index
//! on `(status, created_at DESC)`.

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;

use crate::codec::{self, CodecKind, Value};
use crate::error::{JobErrorDetail, Result};
use crate::job::JobStatus;

use super::{ResultBackend, ResultRecord};

pub struct SqliteResultBackend {
    pool: SqlitePool,
    codec: CodecKind,
}

impl SqliteResultBackend {
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id        TEXT PRIMARY KEY,
                func_name     TEXT NOT NULL,
                args          BLOB,
                kwargs        BLOB,
                status        TEXT NOT NULL,
                result        BLOB,
                error_type    TEXT,
                error_msg     TEXT,
                traceback     TEXT,
                attempts      INTEGER,
                retries_left  INTEGER,
                created_at    REAL NOT NULL,
                completed_at  REAL NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_status_created ON jobs (status, created_at DESC);")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            codec: CodecKind::MsgPack,
        })
    }

    fn to_epoch(ts: DateTime<Utc>) -> f64 {
        ts.timestamp() as f64 + ts.timestamp_subsec_nanos() as f64 / 1e9
    }

    fn from_epoch(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs as i64, ((secs.fract()) * 1e9) as u32)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn row_to_record(&self, row: &sqlx::sqlite::SqliteRow) -> Result<ResultRecord> {
        let status_str: String = row.try_get("status")?;
        let status = match status_str.as_str() {
            "SUCCESS" => JobStatus::Success,
            "FAILED" => JobStatus::Failed,
            "RUNNING" => JobStatus::Running,
            _ => JobStatus::Pending,
        };

        let args_blob: Option<Vec<u8>> = row.try_get("args")?;
        let kwargs_blob: Option<Vec<u8>> = row.try_get("kwargs")?;
        let result_blob: Option<Vec<u8>> = row.try_get("result")?;

        let args: Vec<Value> = args_blob
            .map(|b| codec::decode(self.codec, &b))
            .transpose()?
            .unwrap_or_default();
        let kwargs: BTreeMap<String, Value> = kwargs_blob
            .map(|b| codec::decode(self.codec, &b))
            .transpose()?
            .unwrap_or_default();
        let result = result_blob.map(|b| codec::decode(self.codec, &b)).transpose()?;

        let error_type: Option<String> = row.try_get("error_type")?;
        let error_msg: Option<String> = row.try_get("error_msg")?;
        let traceback: Option<String> = row.try_get("traceback")?;
        let error = error_type.map(|r#type| JobErrorDetail {
            r#type,
            message: error_msg.unwrap_or_default(),
            traceback,
        });

        let attempts: Option<i64> = row.try_get("attempts")?;
        let retries_left: Option<i64> = row.try_get("retries_left")?;
        let created_at: f64 = row.try_get("created_at")?;
        let completed_at: f64 = row.try_get("completed_at")?;

        Ok(ResultRecord {
            job_id: row.try_get("job_id")?,
            func_name: row.try_get("func_name")?,
            status,
            result,
            error,
            args,
            kwargs,
            retries_left: retries_left.map(|n| n as u32),
            attempts: attempts.map(|n| n as u32),
            created_at: Self::from_epoch(created_at),
            completed_at: Self::from_epoch(completed_at),
        })
    }

    async fn upsert(&self, record: ResultRecord, status: &str) -> Result<()> {
        let args_bytes = codec::encode(self.codec, &record.args)?;
        let kwargs_bytes = codec::encode(self.codec, &record.kwargs)?;
        let result_bytes = record
            .result
            .as_ref()
            .map(|r| codec::encode(self.codec, r))
            .transpose()?;
        let (error_type, error_msg, traceback) = match &record.error {
            Some(e) => (Some(e.r#type.clone()), Some(e.message.clone()), e.traceback.clone()),
            None => (None, None, None),
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, func_name, args, kwargs, status, result,
                error_type, error_msg, traceback, attempts, retries_left,
                created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                func_name    = excluded.func_name,
                args         = excluded.args,
                kwargs       = excluded.kwargs,
                status       = excluded.status,
                result       = excluded.result,
                error_type   = excluded.error_type,
                error_msg    = excluded.error_msg,
                traceback    = excluded.traceback,
                attempts     = excluded.attempts,
                retries_left = excluded.retries_left,
                completed_at = excluded.completed_at;
            "#,
        )
        .bind(&record.job_id)
        .bind(&record.func_name)
        .bind(args_bytes)
        .bind(kwargs_bytes)
        .bind(status)
        .bind(result_bytes)
        .bind(error_type)
        .bind(error_msg)
        .bind(traceback)
        .bind(record.attempts.map(|n| n as i64))
        .bind(record.retries_left.map(|n| n as i64))
        .bind(Self::to_epoch(record.created_at))
        .bind(Self::to_epoch(record.completed_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl ResultBackend for SqliteResultBackend {
    async fn set_result(&self, record: ResultRecord) -> Result<()> {
        self.upsert(record, "SUCCESS").await
    }

    async fn get_result(&self, job_id: &str) -> Result<Option<Value>> {
        let row = sqlx::query("SELECT result FROM jobs WHERE job_id = ? AND status = 'SUCCESS';")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let blob: Option<Vec<u8>> = row.try_get("result")?;
                blob.map(|b| codec::decode(self.codec, &b)).transpose()
            }
            None => Ok(None),
        }
    }

    async fn set_error(&self, record: ResultRecord) -> Result<()> {
        self.upsert(record, "FAILED").await
    }

    async fn get_error(&self, job_id: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT error_msg FROM jobs WHERE job_id = ? AND status = 'FAILED';")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.try_get("error_msg").ok()))
    }

    async fn get_full(&self, job_id: &str) -> Result<Option<ResultRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?;")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| self.row_to_record(&r)).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<ResultRecord>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at DESC;")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|r| self.row_to_record(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_and_get_result_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteResultBackend::new(dir.path().join("nuvom.db")).await.unwrap();
        backend
            .set_result(ResultRecord::success("j1", "add", Some(Value::Int(5))))
            .await
            .unwrap();
        assert_eq!(backend.get_result("j1").await.unwrap(), Some(Value::Int(5)));
    }

    #[tokio::test]
    async fn list_jobs_orders_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let backend = SqliteResultBackend::new(dir.path().join("nuvom.db")).await.unwrap();
        backend.set_result(ResultRecord::success("a", "f", None)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        backend.set_result(ResultRecord::success("b", "f", None)).await.unwrap();
        let jobs = backend.list_jobs().await.unwrap();
        assert_eq!(jobs[0].job_id, "b");
    }
}
