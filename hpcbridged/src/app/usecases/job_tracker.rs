// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ControlPlanePort, JobStorePort, SessionPoolPort};
use crate::app::services::slurm;
use crate::app::types::{ExternalHandle, JobState, NewFailure, SchedulerEvent, SimpleDuration};
use crate::app::usecases::file_transfer::FileTransferService;
use crate::app::usecases::poll_agent::SchedulerEventListener;

const REDELIVERY_BATCH: u32 = 50;

/// Turns scheduler events into control-plane notifications.
///
/// Every failure is written to the durable failure queue before the control plane is
/// told, so a notification that cannot be delivered now is retried by
/// [`JobTracker::redeliver_failures`].
pub struct JobTracker {
    store: Arc<dyn JobStorePort>,
    control_plane: Arc<dyn ControlPlanePort>,
    transfers: Arc<FileTransferService>,
    pool: Arc<dyn SessionPoolPort>,
}

impl JobTracker {
    pub fn new(
        store: Arc<dyn JobStorePort>,
        control_plane: Arc<dyn ControlPlanePort>,
        transfers: Arc<FileTransferService>,
        pool: Arc<dyn SessionPoolPort>,
    ) -> Self {
        Self {
            store,
            control_plane,
            transfers,
            pool,
        }
    }

    async fn process(&self, system_id: &str, event: SchedulerEvent) -> AppResult<()> {
        match event {
            SchedulerEvent::Running(_) => {
                self.control_plane
                    .request_state_change(system_id, JobState::Running, None)
                    .await
            }
            SchedulerEvent::Ended(handle) => {
                self.control_plane
                    .request_state_change(system_id, JobState::Transferring, None)
                    .await?;
                let job = self.control_plane.lookup(system_id).await?;
                let submitted = self.transfers.transfer_outputs(&job).await?;
                tracing::info!(count = submitted.len(), "outputs transferred");
                let usage = self.accounting(handle).await?;
                self.control_plane
                    .completed(system_id, Some(usage), true)
                    .await
            }
            SchedulerEvent::Failed(_) | SchedulerEvent::Timeout(_) => {
                self.control_plane.completed(system_id, None, false).await
            }
        }
    }

    /// Wall-clock time the scheduler accounted for the job.
    pub async fn accounting(&self, handle: ExternalHandle) -> AppResult<SimpleDuration> {
        let session = self.pool.acquire().await?;
        let capture = session
            .exec_capture(&slurm::accounting_command(handle))
            .await?;
        drop(session);
        if capture.exit_code != 0 {
            return Err(AppError::with_message(
                AppErrorKind::Remote,
                codes::REMOTE_ERROR,
                format!("sacct exited with status {}", capture.exit_code),
            )
            .with_context(capture.stderr_text().trim().to_string()));
        }
        slurm::parse_elapsed(&capture.stdout_text())
    }

    async fn report_failure(
        &self,
        system_id: Option<&str>,
        handle: ExternalHandle,
        stage: &str,
        err: &AppError,
    ) {
        let message = format!("{stage} failed: {err}");
        tracing::error!(
            handle = %handle,
            system_id = system_id.unwrap_or("-"),
            code = err.code(),
            "{message}"
        );
        let failure = NewFailure {
            system_id: system_id.map(str::to_string),
            scheduler_id: Some(handle),
            stage: stage.to_string(),
            message: message.clone(),
        };
        let queued = match self.store.enqueue_failure(&failure).await {
            Ok(id) => Some(id),
            Err(store_err) => {
                tracing::error!(error = %store_err, "could not persist failure");
                None
            }
        };
        let Some(system_id) = system_id else {
            return;
        };
        match self
            .control_plane
            .request_state_change(system_id, JobState::Failure, Some(&message))
            .await
        {
            Ok(()) => {
                if let Some(id) = queued
                    && let Err(store_err) = self.store.mark_failure_delivered(id).await
                {
                    tracing::warn!(error = %store_err, id, "could not mark failure delivered");
                }
            }
            Err(cp_err) => {
                tracing::warn!(error = %cp_err, "failure notification deferred to redelivery");
            }
        }
    }

    /// Re-sends queued failure notifications. Stops at the first one the control plane
    /// rejects and returns how many were delivered.
    pub async fn redeliver_failures(&self) -> AppResult<usize> {
        let pending = self.store.pending_failures(REDELIVERY_BATCH).await?;
        let mut delivered = 0;
        for failure in pending {
            let Some(system_id) = failure.system_id.as_deref() else {
                continue;
            };
            if let Err(err) = self
                .control_plane
                .request_state_change(system_id, JobState::Failure, Some(&failure.message))
                .await
            {
                tracing::warn!(id = failure.id, error = %err, "redelivery failed");
                break;
            }
            self.store.mark_failure_delivered(failure.id).await?;
            delivered += 1;
        }
        if delivered > 0 {
            tracing::info!(delivered, "failure notifications redelivered");
        }
        Ok(delivered)
    }

    pub async fn run_redelivery(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.redeliver_failures().await {
                tracing::warn!(error = %err, "failure redelivery pass failed");
            }
        }
    }
}

#[async_trait]
impl SchedulerEventListener for JobTracker {
    #[tracing::instrument(
        name = "tracker",
        level = "info",
        skip(self, event),
        fields(handle = %event.handle(), kind = event.kind().as_str())
    )]
    async fn on_event(&self, event: SchedulerEvent) {
        let handle = event.handle();
        let system_id = match self.store.system_id_for_handle(handle).await {
            Ok(Some(id)) => Some(id),
            Ok(None) => {
                let err = AppError::with_message(
                    AppErrorKind::NotFound,
                    codes::NOT_FOUND,
                    format!("no job recorded for handle {handle}"),
                );
                self.report_failure(None, handle, "resolve", &err).await;
                None
            }
            Err(err) => {
                self.report_failure(None, handle, "resolve", &err).await;
                None
            }
        };

        if let Some(system_id) = system_id.as_deref()
            && let Err(err) = self.process(system_id, event).await
        {
            let stage = event.kind().as_str().to_ascii_lowercase();
            self.report_failure(Some(system_id), handle, &stage, &err)
                .await;
        }

        if event.is_terminal()
            && let Err(err) = self.store.mark_finished(handle, event.kind().as_str()).await
        {
            tracing::warn!(error = %err, "could not mark job finished");
        }
    }
}
