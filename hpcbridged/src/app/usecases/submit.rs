// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::io::Write;
use std::sync::Arc;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{JobStorePort, SessionPoolPort};
use crate::app::services::remote_path::{JobLayout, SCRIPT_FILE_NAME};
use crate::app::services::{script, slurm};
use crate::app::types::{ExternalHandle, Job};
use crate::app::usecases::poll_agent::PollAgent;

const SCRIPT_MODE: u32 = 0o600;

/// Uploads a job's batch script, hands it to `sbatch`, and starts tracking the handle.
pub struct Submitter {
    pool: Arc<dyn SessionPoolPort>,
    store: Arc<dyn JobStorePort>,
    poll_agent: Arc<PollAgent>,
    layout: JobLayout,
    account: String,
}

impl Submitter {
    pub fn new(
        pool: Arc<dyn SessionPoolPort>,
        store: Arc<dyn JobStorePort>,
        poll_agent: Arc<PollAgent>,
        layout: JobLayout,
        account: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            store,
            poll_agent,
            layout,
            account: account.into(),
        }
    }

    #[tracing::instrument(
        name = "submit",
        level = "info",
        skip(self, job),
        fields(system_id = %job.system_id)
    )]
    pub async fn submit(&self, job: &Job) -> AppResult<ExternalHandle> {
        let job_dir = self.layout.job_dir(&job.system_id)?;
        let script_path = self.layout.script_path(&job.system_id)?;
        let rendered = script::generate(job, &self.account, &job_dir)?;

        let scratch = write_scratch(&rendered)?;
        let length = rendered.len() as u64;
        let mut local = tokio::fs::File::open(scratch.path()).await.map_err(|err| {
            AppError::with_message(
                AppErrorKind::Internal,
                codes::LOCAL_ERROR,
                format!("cannot reopen scratch script: {err}"),
            )
        })?;

        // the remote job may exist even if bookkeeping after sbatch fails
        self.store
            .record_submission_intent(&job.system_id, &job_dir)
            .await?;

        let session = self.pool.acquire().await?;
        let written = session
            .upload_stream(&script_path, SCRIPT_MODE, length, &mut local)
            .await
            .map_err(|err| {
                AppError::transfer_failed(SCRIPT_FILE_NAME).with_context(err.to_string())
            })?;
        if written != length {
            return Err(AppError::transfer_failed(SCRIPT_FILE_NAME)
                .with_context(format!("wrote {written} of {length} bytes")));
        }

        let capture = session
            .exec_capture(&slurm::sbatch_command(&script_path))
            .await?;
        drop(session);

        let stdout = capture.stdout_text();
        let parsed = if capture.exit_code == 0 {
            slurm::parse_job_id(&stdout)
        } else {
            None
        };
        let Some(id) = parsed else {
            let detail = if capture.stderr_text().trim().is_empty() {
                stdout.trim().to_string()
            } else {
                capture.stderr_text().trim().to_string()
            };
            tracing::warn!(
                exit_code = capture.exit_code,
                detail = %detail,
                "sbatch did not return a job id"
            );
            return Err(AppError::with_message(
                AppErrorKind::BadSchedulerResponse,
                codes::BAD_SCHEDULER_RESPONSE,
                format!("sbatch exited with status {}", capture.exit_code),
            )
            .with_context(detail));
        };

        let handle = ExternalHandle(id);
        self.store.record_handle(&job.system_id, handle).await?;
        self.poll_agent.track(handle);
        tracing::info!(handle = %handle, "job submitted");
        Ok(handle)
    }
}

fn write_scratch(rendered: &str) -> AppResult<tempfile::NamedTempFile> {
    let local_error = |err: std::io::Error| {
        AppError::with_message(
            AppErrorKind::Internal,
            codes::LOCAL_ERROR,
            format!("cannot write scratch script: {err}"),
        )
    };
    let mut scratch = tempfile::Builder::new()
        .prefix("sbatch-")
        .suffix(".sh")
        .tempfile()
        .map_err(local_error)?;
    scratch.write_all(rendered.as_bytes()).map_err(local_error)?;
    scratch.flush().map_err(local_error)?;
    Ok(scratch)
}
