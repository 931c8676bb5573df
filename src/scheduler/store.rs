//! Persistent schedule store: single `scheduled_jobs` table (`spec.md` §6).
//!
//! Grounded on `result/sqlite.rs`'s table/pool/WAL shape, the only other
//! relational persistence this crate does.

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use crate::codec::{self, CodecKind, Value};
use crate::error::Result;

use super::{MisfirePolicy, Schedule, ScheduleType};

pub struct ScheduleStore {
    pool: SqlitePool,
    codec: CodecKind,
}

impl ScheduleStore {
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
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id                TEXT PRIMARY KEY,
                task_name         TEXT NOT NULL,
                schedule_type     TEXT NOT NULL,
                cron_expr         TEXT,
                interval_secs     INTEGER,
                run_at            REAL,
                default_args      BLOB,
                default_kwargs    BLOB,
                enabled           INTEGER NOT NULL,
                next_run_ts       REAL,
                timezone          TEXT NOT NULL,
                misfire_policy    TEXT NOT NULL,
                concurrency_limit INTEGER,
                created_at        REAL NOT NULL,
                updated_at        REAL NOT NULL
            );
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self { pool, codec: CodecKind::MsgPack })
    }

    fn to_epoch(ts: DateTime<Utc>) -> f64 {
        ts.timestamp() as f64 + ts.timestamp_subsec_nanos() as f64 / 1e9
    }

    fn from_epoch(secs: f64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs as i64, ((secs.fract()) * 1e9) as u32)
            .single()
            .unwrap_or_else(Utc::now)
    }

    fn row_to_schedule(&self, row: &sqlx::sqlite::SqliteRow) -> Result<Schedule> {
        let schedule_type: String = row.try_get("schedule_type")?;
        let schedule_type = match schedule_type.as_str() {
            "cron" => ScheduleType::Cron,
            "interval" => ScheduleType::Interval,
            _ => ScheduleType::Once,
        };
        let misfire_policy: String = row.try_get("misfire_policy")?;
        let misfire_policy = match misfire_policy.as_str() {
            "skip" => MisfirePolicy::Skip,
            "reschedule" => MisfirePolicy::Reschedule,
            _ => MisfirePolicy::RunImmediately,
        };

        let args_blob: Option<Vec<u8>> = row.try_get("default_args")?;
        let kwargs_blob: Option<Vec<u8>> = row.try_get("default_kwargs")?;
        let default_args: Vec<Value> = args_blob.map(|b| codec::decode(self.codec, &b)).transpose()?.unwrap_or_default();
        let default_kwargs: BTreeMap<String, Value> =
            kwargs_blob.map(|b| codec::decode(self.codec, &b)).transpose()?.unwrap_or_default();

        let run_at: Option<f64> = row.try_get("run_at")?;
        let next_run_ts: Option<f64> = row.try_get("next_run_ts")?;
        let created_at: f64 = row.try_get("created_at")?;
        let updated_at: f64 = row.try_get("updated_at")?;
        let enabled: i64 = row.try_get("enabled")?;
        let concurrency_limit: Option<i64> = row.try_get("concurrency_limit")?;
        let interval_secs: Option<i64> = row.try_get("interval_secs")?;

        Ok(Schedule {
            id: row.try_get("id")?,
            task_name: row.try_get("task_name")?,
            schedule_type,
            cron_expr: row.try_get("cron_expr")?,
            interval_secs: interval_secs.map(|n| n as u64),
            run_at: run_at.map(Self::from_epoch),
            default_args,
            default_kwargs,
            enabled: enabled != 0,
            next_run_ts: next_run_ts.map(Self::from_epoch),
            timezone: row.try_get("timezone")?,
            misfire_policy,
            concurrency_limit: concurrency_limit.map(|n| n as u32),
            created_at: Self::from_epoch(created_at),
            updated_at: Self::from_epoch(updated_at),
        })
    }

    pub async fn upsert(&self, schedule: &Schedule) -> Result<()> {
        let schedule_type = match schedule.schedule_type {
            ScheduleType::Cron => "cron",
            ScheduleType::Interval => "interval",
            ScheduleType::Once => "once",
        };
        let misfire_policy = match schedule.misfire_policy {
            MisfirePolicy::RunImmediately => "run_immediately",
            MisfirePolicy::Skip => "skip",
            MisfirePolicy::Reschedule => "reschedule",
        };
        let args_bytes = codec::encode(self.codec, &schedule.default_args)?;
        let kwargs_bytes = codec::encode(self.codec, &schedule.default_kwargs)?;

        sqlx::query(
            r#"
            INSERT INTO scheduled_jobs (
                id, task_name, schedule_type, cron_expr, interval_secs, run_at,
                default_args, default_kwargs, enabled, next_run_ts, timezone,
                misfire_policy, concurrency_limit, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                task_name         = excluded.task_name,
                schedule_type     = excluded.schedule_type,
                cron_expr         = excluded.cron_expr,
                interval_secs     = excluded.interval_secs,
                run_at            = excluded.run_at,
                default_args      = excluded.default_args,
                default_kwargs    = excluded.default_kwargs,
                enabled           = excluded.enabled,
                next_run_ts       = excluded.next_run_ts,
                timezone          = excluded.timezone,
                misfire_policy    = excluded.misfire_policy,
                concurrency_limit = excluded.concurrency_limit,
                updated_at        = excluded.updated_at;
            "#,
        )
        .bind(&schedule.id)
        .bind(&schedule.task_name)
        .bind(schedule_type)
        .bind(&schedule.cron_expr)
        .bind(schedule.interval_secs.map(|n| n as i64))
        .bind(schedule.run_at.map(Self::to_epoch))
        .bind(args_bytes)
        .bind(kwargs_bytes)
        .bind(schedule.enabled as i64)
        .bind(schedule.next_run_ts.map(Self::to_epoch))
        .bind(&schedule.timezone)
        .bind(misfire_policy)
        .bind(schedule.concurrency_limit.map(|n| n as i64))
        .bind(Self::to_epoch(schedule.created_at))
        .bind(Self::to_epoch(schedule.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?;").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<Schedule>> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE id = ?;").bind(id).fetch_optional(&self.pool).await?;
        row.map(|r| self.row_to_schedule(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query("SELECT * FROM scheduled_jobs ORDER BY id;").fetch_all(&self.pool).await?;
        rows.iter().map(|r| self.row_to_schedule(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ScheduleType;

    #[tokio::test]
    async fn upsert_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("schedules.db")).await.unwrap();
        let schedule = Schedule::new("s1", "tick", ScheduleType::Interval).with_interval_secs(60);
        store.upsert(&schedule).await.unwrap();
        let loaded = store.get("s1").await.unwrap().unwrap();
        assert_eq!(loaded.task_name, "tick");
        assert_eq!(loaded.interval_secs, Some(60));
    }

    #[tokio::test]
    async fn remove_deletes_row() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScheduleStore::new(dir.path().join("schedules.db")).await.unwrap();
        let schedule = Schedule::new("s1", "tick", ScheduleType::Once);
        store.upsert(&schedule).await.unwrap();
        store.remove("s1").await.unwrap();
        assert!(store.get("s1").await.unwrap().is_none());
    }
}
