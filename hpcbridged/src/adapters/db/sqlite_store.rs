// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use async_trait::async_trait;
use time::format_description::well_known::Rfc3339;

use crate::adapters::db::{JobStore, JobStoreError};
use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ClockPort, JobStorePort};
use crate::app::types::{ExternalHandle, FailureRecord, JobRecord, NewFailure};

#[derive(Clone)]
pub struct SqliteStoreAdapter {
    store: Arc<JobStore>,
    clock: Arc<dyn ClockPort>,
}

impl SqliteStoreAdapter {
    pub fn new(store: JobStore, clock: Arc<dyn ClockPort>) -> Self {
        Self {
            store: Arc::new(store),
            clock,
        }
    }

    fn now(&self) -> String {
        self.clock
            .now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into())
    }
}

/// Persistence errors stop here; the app core only sees `AppError`.
fn map_store_error(err: JobStoreError) -> AppError {
    match err {
        JobStoreError::EmptySystemId => {
            AppError::invalid_argument("system id must not be empty")
        }
        JobStoreError::LiveHandle(system_id) => AppError::with_message(
            AppErrorKind::Conflict,
            codes::CONFLICT,
            format!("job '{system_id}' is still tracked by the scheduler"),
        ),
        JobStoreError::JobNotFound(system_id) => AppError::with_message(
            AppErrorKind::NotFound,
            codes::NOT_FOUND,
            format!("no submission recorded for job '{system_id}'"),
        ),
        JobStoreError::UnknownState(state) => {
            AppError::internal(format!("unknown job state '{state}' in store"))
        }
        JobStoreError::Sqlx(err) => {
            AppError::new(AppErrorKind::Internal, codes::INTERNAL_ERROR)
                .with_context(err.to_string())
        }
    }
}

#[async_trait]
impl JobStorePort for SqliteStoreAdapter {
    async fn record_submission_intent(
        &self,
        system_id: &str,
        working_dir: &str,
    ) -> AppResult<()> {
        self.store
            .record_submission_intent(system_id, working_dir, &self.now())
            .await
            .map_err(map_store_error)
    }

    async fn record_handle(&self, system_id: &str, handle: ExternalHandle) -> AppResult<()> {
        self.store
            .record_handle(system_id, handle, &self.now())
            .await
            .map_err(map_store_error)
    }

    async fn get_job(&self, system_id: &str) -> AppResult<Option<JobRecord>> {
        self.store.get_job(system_id).await.map_err(map_store_error)
    }

    async fn system_id_for_handle(&self, handle: ExternalHandle) -> AppResult<Option<String>> {
        self.store
            .system_id_for_handle(handle)
            .await
            .map_err(map_store_error)
    }

    async fn list_active_handles(&self) -> AppResult<Vec<ExternalHandle>> {
        self.store
            .list_active_handles()
            .await
            .map_err(map_store_error)
    }

    async fn mark_finished(&self, handle: ExternalHandle, terminal_state: &str) -> AppResult<()> {
        self.store
            .mark_finished(handle, terminal_state, &self.now())
            .await
            .map_err(map_store_error)
    }

    async fn enqueue_failure(&self, failure: &NewFailure) -> AppResult<i64> {
        self.store
            .enqueue_failure(failure, &self.now())
            .await
            .map_err(map_store_error)
    }

    async fn pending_failures(&self, limit: u32) -> AppResult<Vec<FailureRecord>> {
        self.store
            .pending_failures(limit)
            .await
            .map_err(map_store_error)
    }

    async fn mark_failure_delivered(&self, id: i64) -> AppResult<()> {
        self.store
            .mark_failure_delivered(id, &self.now())
            .await
            .map_err(map_store_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::OffsetDateTime;
    use time::macros::datetime;

    struct FixedClock(OffsetDateTime);

    impl ClockPort for FixedClock {
        fn now_utc(&self) -> OffsetDateTime {
            self.0
        }
    }

    async fn adapter() -> SqliteStoreAdapter {
        let store = JobStore::open_memory().await.unwrap();
        SqliteStoreAdapter::new(store, Arc::new(FixedClock(datetime!(2026-03-01 12:00 UTC))))
    }

    #[tokio::test]
    async fn timestamps_come_from_the_clock() {
        let db = adapter().await;
        db.record_submission_intent("job-1", "/r/job-1").await.unwrap();
        db.record_handle("job-1", ExternalHandle(5)).await.unwrap();

        let rec = db.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(rec.created_at, "2026-03-01T12:00:00Z");
        assert_eq!(rec.submitted_at.as_deref(), Some("2026-03-01T12:00:00Z"));
    }

    #[tokio::test]
    async fn store_errors_map_to_app_kinds() {
        let db = adapter().await;
        let err = db
            .record_handle("missing", ExternalHandle(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), &AppErrorKind::NotFound);

        db.record_submission_intent("job-1", "/r").await.unwrap();
        db.record_handle("job-1", ExternalHandle(1)).await.unwrap();
        let err = db.record_submission_intent("job-1", "/r").await.unwrap_err();
        assert_eq!(err.kind(), &AppErrorKind::Conflict);
        assert_eq!(err.code(), codes::CONFLICT);

        let err = db.record_submission_intent("", "/r").await.unwrap_err();
        assert_eq!(err.kind(), &AppErrorKind::InvalidArgument);
    }
}
