// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{PooledSession, SessionPoolPort};

use super::{SessionManager, SshParams, SshRemoteSession, map_connect_error};

/// Builds the connection behind a pool slot.
pub trait SessionFactory: Send + Sync {
    fn build(&self, params: SshParams) -> Arc<SessionManager>;
}

#[derive(Default)]
pub struct DefaultSessionFactory;

impl SessionFactory for DefaultSessionFactory {
    fn build(&self, params: SshParams) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(params))
    }
}

/// Fixed number of SSH connections shared by every caller. A slot is held from
/// `acquire` until the returned guard drops; idle connections are reused.
pub struct SshSessionPool {
    params: SshParams,
    command_timeout: Duration,
    slots: Arc<Semaphore>,
    idle: Arc<Mutex<Vec<Arc<SessionManager>>>>,
    factory: Arc<dyn SessionFactory>,
}

impl SshSessionPool {
    pub fn new(params: SshParams, size: usize, command_timeout: Duration) -> Self {
        Self::with_factory(params, size, command_timeout, Arc::new(DefaultSessionFactory))
    }

    pub fn with_factory(
        params: SshParams,
        size: usize,
        command_timeout: Duration,
        factory: Arc<dyn SessionFactory>,
    ) -> Self {
        Self {
            params,
            command_timeout,
            slots: Arc::new(Semaphore::new(size.max(1))),
            idle: Arc::new(Mutex::new(Vec::new())),
            factory,
        }
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub fn idle_connections(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    fn take_idle(&self) -> Option<Arc<SessionManager>> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    /// Refuses further acquisitions and closes every idle connection.
    pub async fn shutdown(&self) {
        self.slots.close();
        let drained: Vec<Arc<SessionManager>> = match self.idle.lock() {
            Ok(mut idle) => idle.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for manager in drained {
            manager.shutdown().await;
        }
        log::info!("ssh session pool shut down");
    }
}

#[async_trait]
impl SessionPoolPort for SshSessionPool {
    async fn acquire(&self) -> AppResult<PooledSession> {
        let permit = self.slots.clone().acquire_owned().await.map_err(|_| {
            AppError::with_message(
                AppErrorKind::Remote,
                codes::CONNECTION_FAILURE,
                "ssh session pool is shut down",
            )
        })?;
        let manager = self
            .take_idle()
            .unwrap_or_else(|| self.factory.build(self.params.clone()));

        let connected = tokio::time::timeout(self.command_timeout, manager.ensure_connected()).await;
        match connected {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                log::warn!(
                    "cannot connect to {}@{}:{}: {err:#}",
                    self.params.username,
                    self.params.host,
                    self.params.port
                );
                return Err(map_connect_error(err));
            }
            Err(_) => {
                return Err(AppError::with_message(
                    AppErrorKind::Remote,
                    codes::TIMEOUT,
                    format!(
                        "ssh connect to {} timed out after {}s",
                        self.params.host,
                        self.command_timeout.as_secs()
                    ),
                ));
            }
        }

        let session = Arc::new(SshRemoteSession::new(
            manager.clone(),
            self.command_timeout,
        ));
        let idle = self.idle.clone();
        Ok(PooledSession::new(
            session,
            Box::new(move || {
                if let Ok(mut idle) = idle.lock() {
                    idle.push(manager);
                }
                drop(permit);
            }),
        ))
    }
}
