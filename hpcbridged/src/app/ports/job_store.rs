// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{ExternalHandle, FailureRecord, JobRecord, NewFailure};

#[async_trait]
pub trait JobStorePort: Send + Sync {
    /// Written before `sbatch` runs so a crash between submission and bookkeeping
    /// leaves a trace.
    async fn record_submission_intent(&self, system_id: &str, working_dir: &str)
    -> AppResult<()>;
    async fn record_handle(&self, system_id: &str, handle: ExternalHandle) -> AppResult<()>;
    async fn get_job(&self, system_id: &str) -> AppResult<Option<JobRecord>>;
    async fn system_id_for_handle(&self, handle: ExternalHandle) -> AppResult<Option<String>>;
    async fn list_active_handles(&self) -> AppResult<Vec<ExternalHandle>>;
    async fn mark_finished(&self, handle: ExternalHandle, terminal_state: &str) -> AppResult<()>;
    async fn enqueue_failure(&self, failure: &NewFailure) -> AppResult<i64>;
    async fn pending_failures(&self, limit: u32) -> AppResult<Vec<FailureRecord>>;
    async fn mark_failure_delivered(&self, id: i64) -> AppResult<()>;
}
