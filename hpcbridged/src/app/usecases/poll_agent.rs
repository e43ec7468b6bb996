// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::SessionPoolPort;
use crate::app::services::slurm;
use crate::app::types::{ExternalHandle, SchedulerEvent, SchedulerEventKind};

/// Receives every event the poll agent detects. Calls are awaited one at a time, so a
/// slow listener delays the rest of the tick.
#[async_trait]
pub trait SchedulerEventListener: Send + Sync {
    async fn on_event(&self, event: SchedulerEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollAgentConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Handle that is reported as `Ended` without asking the scheduler.
    pub sentinel_handle: Option<ExternalHandle>,
}

impl Default for PollAgentConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(5),
            interval: Duration::from_secs(30),
            sentinel_handle: None,
        }
    }
}

/// Periodically asks the scheduler about every tracked handle and fans the resulting
/// lifecycle events out to listeners.
pub struct PollAgent {
    pool: Arc<dyn SessionPoolPort>,
    config: PollAgentConfig,
    // handle -> last kind emitted for it
    tracked: Mutex<BTreeMap<ExternalHandle, Option<SchedulerEventKind>>>,
    listeners: RwLock<Vec<Arc<dyn SchedulerEventListener>>>,
}

impl PollAgent {
    pub fn new(pool: Arc<dyn SessionPoolPort>, config: PollAgentConfig) -> Self {
        Self {
            pool,
            config,
            tracked: Mutex::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PollAgentConfig {
        &self.config
    }

    pub fn track(&self, handle: ExternalHandle) {
        let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
        tracked.entry(handle).or_insert(None);
        tracing::debug!(handle = %handle, tracked = tracked.len(), "tracking job");
    }

    pub fn untrack(&self, handle: ExternalHandle) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle)
            .is_some()
    }

    pub fn is_tracked(&self, handle: ExternalHandle) -> bool {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&handle)
    }

    pub fn tracked_handles(&self) -> Vec<ExternalHandle> {
        self.tracked
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Listeners are notified in the order they subscribed.
    pub fn subscribe(&self, listener: Arc<dyn SchedulerEventListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    /// Runs one poll cycle and returns the events it dispatched.
    pub async fn tick(&self) -> AppResult<Vec<SchedulerEvent>> {
        let handles = self.tracked_handles();
        if handles.is_empty() {
            return Ok(Vec::new());
        }

        let sentinel = self.config.sentinel_handle;
        let queried: Vec<ExternalHandle> = handles
            .iter()
            .copied()
            .filter(|h| Some(*h) != sentinel)
            .collect();

        let states = if queried.is_empty() {
            HashMap::new()
        } else {
            self.query_states(&queried).await?
        };

        let mut events = Vec::new();
        {
            let mut tracked = self.tracked.lock().unwrap_or_else(|e| e.into_inner());
            for handle in handles {
                let kind = if Some(handle) == sentinel {
                    Some(SchedulerEventKind::Ended)
                } else {
                    states.get(&handle).and_then(|s| slurm::event_kind_for_state(s))
                };
                let Some(kind) = kind else {
                    continue;
                };
                // untracked while the query was in flight
                let Some(last) = tracked.get_mut(&handle) else {
                    continue;
                };
                if kind.is_terminal() {
                    tracked.remove(&handle);
                } else if *last == Some(kind) {
                    continue;
                } else {
                    *last = Some(kind);
                }
                events.push(SchedulerEvent::new(kind, handle));
            }
        }

        if !events.is_empty() {
            tracing::info!(count = events.len(), "dispatching scheduler events");
        }
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for event in &events {
            tracing::debug!(handle = %event.handle(), kind = event.kind().as_str(), "scheduler event");
            for listener in &listeners {
                listener.on_event(*event).await;
            }
        }
        Ok(events)
    }

    async fn query_states(
        &self,
        handles: &[ExternalHandle],
    ) -> AppResult<HashMap<ExternalHandle, String>> {
        let session = self.pool.acquire().await?;
        let command = slurm::status_query_command(handles);
        let capture = session.exec_capture(&command).await?;
        drop(session);
        if capture.exit_code != 0 {
            return Err(AppError::with_message(
                AppErrorKind::Remote,
                codes::REMOTE_ERROR,
                format!("sacct exited with status {}", capture.exit_code),
            )
            .with_context(capture.stderr_text().trim().to_string()));
        }
        Ok(slurm::parse_sacct_job_states(&capture.stdout_text())
            .into_iter()
            .collect())
    }

    /// Ticks at a fixed rate until `shutdown` fires. A tick that overruns the period
    /// delays the next one instead of overlapping it.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        tracing::info!(
            initial_delay_secs = self.config.initial_delay.as_secs(),
            interval_secs = self.config.interval.as_secs(),
            "starting poll agent"
        );
        let start = Instant::now() + self.config.initial_delay;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(err) = self.tick().await {
                tracing::warn!(error = %err, code = err.code(), "poll cycle failed");
            }
        }
        tracing::info!("poll agent stopped");
    }
}
