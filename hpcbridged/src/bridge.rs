// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Assembles the services from configuration and owns their background tasks.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::adapters::db::{JobStore, SqliteStoreAdapter};
use crate::adapters::http::HttpControlPlane;
use crate::adapters::ssh::{SshParams, SshSessionPool};
use crate::adapters::time::SystemClock;
use crate::app::ports::{ControlPlanePort, JobStorePort, SessionPoolPort};
use crate::app::services::remote_path::JobLayout;
use crate::app::types::ExternalHandle;
use crate::app::usecases::file_transfer::FileTransferService;
use crate::app::usecases::job_tracker::JobTracker;
use crate::app::usecases::log_tail::LogTailService;
use crate::app::usecases::poll_agent::{PollAgent, PollAgentConfig};
use crate::app::usecases::submit::Submitter;
use crate::config::{self, Config};

/// Every long-lived service of one bridge instance, sharing one SSH pool and one store.
pub struct Bridge {
    pub submitter: Arc<Submitter>,
    pub transfers: Arc<FileTransferService>,
    pub log_tail: Arc<LogTailService>,
    pub tracker: Arc<JobTracker>,
    pub poll_agent: Arc<PollAgent>,
    pub store: Arc<dyn JobStorePort>,
    pool: Arc<SshSessionPool>,
    redelivery_period: Duration,
}

/// Handles of the spawned background loops.
pub struct Running {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Bridge {
    pub async fn from_config(config: &Config) -> Result<Self> {
        config::ensure_database_dir(&config.database_path)?;
        let job_store = JobStore::open(&config.database_path)
            .await
            .with_context(|| {
                format!(
                    "failed to open job database {}",
                    config.database_path.display()
                )
            })?;
        let store: Arc<dyn JobStorePort> =
            Arc::new(SqliteStoreAdapter::new(job_store, Arc::new(SystemClock)));

        let params = SshParams {
            host: config.ssh.host.clone(),
            port: config.ssh.port,
            username: config.ssh.username.clone(),
            identity_path: config.ssh.identity_path.clone(),
            known_hosts_path: config.ssh.known_hosts_path.clone(),
            keepalive_secs: config.ssh.keepalive_secs,
        };
        let pool = Arc::new(SshSessionPool::new(
            params,
            config.ssh.pool_size,
            Duration::from_secs(config.ssh.command_timeout_secs),
        ));

        let control_plane: Arc<dyn ControlPlanePort> = Arc::new(
            HttpControlPlane::new(
                config.control_plane.base_url.clone(),
                config.control_plane.token.clone(),
                Duration::from_secs(config.control_plane.request_timeout_secs),
            )
            .map_err(|err| anyhow::anyhow!("failed to build control plane client: {err}"))?,
        );

        let poll_config = PollAgentConfig {
            initial_delay: Duration::from_secs(config.poll_initial_delay_secs),
            interval: Duration::from_secs(config.poll_interval_secs),
            sentinel_handle: config.slurm.sentinel_handle.map(ExternalHandle),
        };
        Ok(Self::assemble(
            pool,
            store,
            control_plane,
            JobLayout::new(config.slurm.working_root.clone()),
            config.slurm.account.clone(),
            poll_config,
            Duration::from_secs(config.failure_redelivery_secs),
        ))
    }

    fn assemble(
        pool: Arc<SshSessionPool>,
        store: Arc<dyn JobStorePort>,
        control_plane: Arc<dyn ControlPlanePort>,
        layout: JobLayout,
        account: String,
        poll_config: PollAgentConfig,
        redelivery_period: Duration,
    ) -> Self {
        let sessions: Arc<dyn SessionPoolPort> = pool.clone();
        let poll_agent = Arc::new(PollAgent::new(sessions.clone(), poll_config));
        let transfers = Arc::new(FileTransferService::new(
            sessions.clone(),
            control_plane.clone(),
            layout.clone(),
        ));
        let tracker = Arc::new(JobTracker::new(
            store.clone(),
            control_plane,
            transfers.clone(),
            sessions.clone(),
        ));
        poll_agent.subscribe(tracker.clone());
        let submitter = Arc::new(Submitter::new(
            sessions.clone(),
            store.clone(),
            poll_agent.clone(),
            layout.clone(),
            account,
        ));
        let log_tail = Arc::new(LogTailService::new(sessions, layout));

        Self {
            submitter,
            transfers,
            log_tail,
            tracker,
            poll_agent,
            store,
            pool,
            redelivery_period,
        }
    }

    /// Re-tracks every handle the store still considers live. Returns how many.
    pub async fn restore_tracking(&self) -> Result<usize> {
        let handles = self
            .store
            .list_active_handles()
            .await
            .map_err(|err| anyhow::anyhow!("failed to list active jobs: {err}"))?;
        for handle in &handles {
            self.poll_agent.track(*handle);
        }
        Ok(handles.len())
    }

    pub fn start(&self) -> Running {
        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(self.poll_agent.clone().run(shutdown.child_token())),
            tokio::spawn(
                self.tracker
                    .clone()
                    .run_redelivery(self.redelivery_period, shutdown.child_token()),
            ),
        ];
        Running { shutdown, tasks }
    }

    /// Stops the loops, waits for them, then closes the SSH connections.
    pub async fn stop(&self, running: Running) {
        running.shutdown.cancel();
        for task in running.tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "background task ended abnormally");
            }
        }
        self.pool.shutdown().await;
    }
}
