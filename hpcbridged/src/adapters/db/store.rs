// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use sqlx::{
    Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{path::Path, str::FromStr, time::Duration};
use thiserror::Error;

use crate::app::types::{ExternalHandle, FailureRecord, JobRecord, JobState, NewFailure};

#[derive(Debug, Error)]
pub enum JobStoreError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("empty system id")]
    EmptySystemId,
    #[error("job {0} already has a live scheduler handle")]
    LiveHandle(String),
    #[error("job not found: {0}")]
    JobNotFound(String),
    #[error("unknown job state in database: {0}")]
    UnknownState(String),
}

pub type Result<T> = std::result::Result<T, JobStoreError>;

/// Durable record of submitted jobs and of failures still owed to the control plane.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) a file-backed SQLite DB.
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let url = format!("sqlite://{}", path_ref.to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    #[allow(dead_code)]
    pub async fn open_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> Result<()> {
        // Improve concurrency for file DBs.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        self.ensure_jobs_table().await?;
        self.ensure_failures_table().await?;
        Ok(())
    }

    async fn ensure_jobs_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              system_id TEXT PRIMARY KEY,
              working_dir TEXT NOT NULL,
              scheduler_id INTEGER,
              state TEXT NOT NULL,
              created_at TEXT NOT NULL,
              submitted_at TEXT,
              finished_at TEXT,
              terminal_state TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_live_scheduler_id
              ON jobs(scheduler_id)
              WHERE scheduler_id IS NOT NULL AND finished_at IS NULL;
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_failures_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS failures (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              system_id TEXT,
              scheduler_id INTEGER,
              stage TEXT NOT NULL,
              message TEXT NOT NULL,
              created_at TEXT NOT NULL,
              delivered_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_failures_pending
              ON failures(delivered_at, id);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Inserts or resets the row for `system_id`. A job whose handle is still live
    /// cannot be re-submitted.
    pub async fn record_submission_intent(
        &self,
        system_id: &str,
        working_dir: &str,
        now: &str,
    ) -> Result<()> {
        if system_id.trim().is_empty() {
            return Err(JobStoreError::EmptySystemId);
        }
        let mut tx = self.pool.begin().await?;
        let live: Option<i64> = sqlx::query_scalar(
            r#"
            select scheduler_id from jobs
            where system_id = ?1 and scheduler_id is not null and finished_at is null
            "#,
        )
        .bind(system_id)
        .fetch_optional(&mut *tx)
        .await?;
        if live.is_some() {
            return Err(JobStoreError::LiveHandle(system_id.to_string()));
        }
        sqlx::query(
            r#"
            insert into jobs (system_id, working_dir, scheduler_id, state, created_at)
            values (?1, ?2, null, ?3, ?4)
            on conflict(system_id) do update set
              working_dir = excluded.working_dir,
              scheduler_id = null,
              state = excluded.state,
              created_at = excluded.created_at,
              submitted_at = null,
              finished_at = null,
              terminal_state = null
            "#,
        )
        .bind(system_id)
        .bind(working_dir)
        .bind(JobState::Prepared.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn record_handle(
        &self,
        system_id: &str,
        handle: ExternalHandle,
        now: &str,
    ) -> Result<()> {
        let res = sqlx::query(
            r#"
            update jobs
            set scheduler_id = ?1,
                state = ?2,
                submitted_at = ?3
            where system_id = ?4
            "#,
        )
        .bind(handle.0)
        .bind(JobState::Scheduled.as_str())
        .bind(now)
        .bind(system_id)
        .execute(&self.pool)
        .await?;
        if res.rows_affected() == 0 {
            return Err(JobStoreError::JobNotFound(system_id.to_string()));
        }
        Ok(())
    }

    pub async fn get_job(&self, system_id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query("select * from jobs where system_id = ?")
            .bind(system_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_job).transpose()
    }

    /// Prefers the live row; otherwise the most recently submitted one.
    pub async fn system_id_for_handle(&self, handle: ExternalHandle) -> Result<Option<String>> {
        let id = sqlx::query_scalar(
            r#"
            select system_id from jobs
            where scheduler_id = ?1
            order by (finished_at is null) desc, submitted_at desc
            limit 1
            "#,
        )
        .bind(handle.0)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    pub async fn list_active_handles(&self) -> Result<Vec<ExternalHandle>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            select scheduler_id from jobs
            where scheduler_id is not null and finished_at is null
            order by scheduler_id asc
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(ExternalHandle).collect())
    }

    pub async fn mark_finished(
        &self,
        handle: ExternalHandle,
        terminal_state: &str,
        now: &str,
    ) -> Result<()> {
        let state = if terminal_state == "ENDED" {
            JobState::Success
        } else {
            JobState::Failure
        };
        sqlx::query(
            r#"
            update jobs
            set finished_at = ?1,
                terminal_state = ?2,
                state = ?3
            where scheduler_id = ?4 and finished_at is null
            "#,
        )
        .bind(now)
        .bind(terminal_state)
        .bind(state.as_str())
        .bind(handle.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn enqueue_failure(&self, failure: &NewFailure, now: &str) -> Result<i64> {
        let rec = sqlx::query(
            r#"
            insert into failures (system_id, scheduler_id, stage, message, created_at)
            values (?1, ?2, ?3, ?4, ?5)
            returning id
            "#,
        )
        .bind(failure.system_id.as_deref())
        .bind(failure.scheduler_id.map(|h| h.0))
        .bind(&failure.stage)
        .bind(&failure.message)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(rec.try_get("id")?)
    }

    /// Undelivered failures that name a job, oldest first. Failures without a system id
    /// cannot be addressed to the control plane and stay in the table for operators.
    pub async fn pending_failures(&self, limit: u32) -> Result<Vec<FailureRecord>> {
        let rows = sqlx::query(
            r#"
            select * from failures
            where delivered_at is null and system_id is not null
            order by id asc
            limit ?1
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_failure).collect()
    }

    pub async fn mark_failure_delivered(&self, id: i64, now: &str) -> Result<()> {
        sqlx::query("update failures set delivered_at = ?1 where id = ?2")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

// -- helpers

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> Result<JobRecord> {
    let state: String = row.try_get("state")?;
    Ok(JobRecord {
        system_id: row.try_get("system_id")?,
        working_dir: row.try_get("working_dir")?,
        scheduler_id: row
            .try_get::<Option<i64>, _>("scheduler_id")?
            .map(ExternalHandle),
        state: JobState::from_db(&state).ok_or(JobStoreError::UnknownState(state))?,
        created_at: row.try_get("created_at")?,
        submitted_at: row.try_get("submitted_at")?,
        finished_at: row.try_get("finished_at")?,
        terminal_state: row.try_get("terminal_state")?,
    })
}

fn row_to_failure(row: sqlx::sqlite::SqliteRow) -> Result<FailureRecord> {
    Ok(FailureRecord {
        id: row.try_get("id")?,
        system_id: row.try_get("system_id")?,
        scheduler_id: row
            .try_get::<Option<i64>, _>("scheduler_id")?
            .map(ExternalHandle),
        stage: row.try_get("stage")?,
        message: row.try_get("message")?,
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}
