// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::app::errors::AppResult;
use crate::app::types::{Job, JobState, SimpleDuration};

/// Byte source handed to the control plane; read exactly once.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
/// Callbacks into the cloud side that owns the job's lifecycle.
pub trait ControlPlanePort: Send + Sync {
    async fn request_state_change(
        &self,
        system_id: &str,
        state: JobState,
        message: Option<&str>,
    ) -> AppResult<()>;

    async fn lookup(&self, system_id: &str) -> AppResult<Job>;

    async fn submit_file(
        &self,
        system_id: &str,
        relative_path: &str,
        length: u64,
        content: ByteStream,
    ) -> AppResult<()>;

    async fn completed(
        &self,
        system_id: &str,
        usage: Option<SimpleDuration>,
        success: bool,
    ) -> AppResult<()>;
}
