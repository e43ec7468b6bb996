// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! In-memory doubles for the ports, shared by the use case tests.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{
    ByteStream, ControlPlanePort, ExecCapture, JobStorePort, PooledSession, RemoteFileStat,
    RemoteReader, RemoteSession, SessionPoolPort,
};
use crate::app::services::output_glob::compile_output_glob;
use crate::app::services::remote_path::{normalize_path, relative_to};
use crate::app::types::{
    ExternalHandle, FailureRecord, Job, JobRecord, JobState, NewFailure, SimpleDuration,
};

pub fn capture(exit_code: i32, stdout: &str) -> ExecCapture {
    ExecCapture {
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        exit_code,
    }
}

#[derive(Default)]
pub struct ClusterState {
    pub files: BTreeMap<String, Vec<u8>>,
    pub modes: BTreeMap<String, u32>,
    pub dirs: BTreeSet<String>,
    /// path -> canonical target reported by `real_path`
    pub links: BTreeMap<String, String>,
    /// later entries win; matched by command prefix
    pub responses: Vec<(String, ExecCapture)>,
    pub commands: Vec<String>,
    pub downloads: Vec<String>,
    pub mkdir_status: i32,
    pub rm_status: i32,
    pub unzip_status: i32,
    pub zip_status: i32,
    pub fail_transport: bool,
}

/// Scripted stand-in for the cluster login node.
#[derive(Default)]
pub struct FakeCluster {
    pub state: Mutex<ClusterState>,
    calls: AtomicUsize,
    acquired: AtomicUsize,
    outstanding: Arc<AtomicUsize>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn respond(&self, prefix: &str, reply: ExecCapture) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((prefix.to_string(), reply));
    }

    pub fn put_file(&self, path: &str, content: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.to_string(), content.to_vec());
    }

    pub fn put_dir(&self, path: &str) {
        self.state.lock().unwrap().dirs.insert(path.to_string());
    }

    pub fn link(&self, path: &str, target: &str) {
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.to_string(), b"link".to_vec());
        state.links.insert(path.to_string(), target.to_string());
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut ClusterState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(path).cloned()
    }

    pub fn exists(&self, path: &str) -> bool {
        let state = self.state.lock().unwrap();
        state.dirs.contains(path) || state.files.contains_key(path)
    }

    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn downloads(&self) -> Vec<String> {
        self.state.lock().unwrap().downloads.clone()
    }

    /// Every remote operation, whatever its kind.
    pub fn remote_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn sessions_acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn sessions_outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn enter(&self) -> AppResult<std::sync::MutexGuard<'_, ClusterState>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        if state.fail_transport {
            return Err(AppError::with_message(
                AppErrorKind::Remote,
                codes::CONNECTION_FAILURE,
                "connection reset",
            ));
        }
        Ok(state)
    }
}

fn under(base: &str, path: &str) -> bool {
    path.starts_with(&format!("{}/", base.trim_end_matches('/')))
}

#[async_trait]
impl RemoteSession for FakeCluster {
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture> {
        let mut state = self.enter()?;
        state.commands.push(command.to_string());
        let reply = state
            .responses
            .iter()
            .rev()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, reply)| reply.clone());
        Ok(reply.unwrap_or_else(|| capture(127, "")))
    }

    async fn mkdir(&self, paths: &[&str]) -> AppResult<i32> {
        let mut state = self.enter()?;
        if state.mkdir_status != 0 {
            return Ok(state.mkdir_status);
        }
        for path in paths {
            let mut cur = normalize_path(path);
            loop {
                state.dirs.insert(cur.to_string_lossy().into_owned());
                if !cur.pop() || cur.as_os_str() == "/" {
                    break;
                }
            }
        }
        Ok(0)
    }

    async fn rm(&self, path: &str) -> AppResult<i32> {
        let mut state = self.enter()?;
        if state.rm_status != 0 {
            return Ok(state.rm_status);
        }
        state.files.retain(|p, _| p != path && !under(path, p));
        state.dirs.retain(|p| p != path && !under(path, p));
        Ok(0)
    }

    async fn stat(&self, path: &str) -> AppResult<Option<RemoteFileStat>> {
        let state = self.enter()?;
        if state.dirs.contains(path) {
            return Ok(Some(RemoteFileStat {
                size: 4096,
                is_dir: true,
            }));
        }
        Ok(state.files.get(path).map(|content| RemoteFileStat {
            size: content.len() as u64,
            is_dir: false,
        }))
    }

    async fn list_glob(&self, base: &str, pattern: &str) -> AppResult<Vec<String>> {
        let state = self.enter()?;
        let matcher = compile_output_glob(pattern)?;
        let mut out: Vec<String> = state
            .files
            .keys()
            .chain(state.dirs.iter())
            .filter(|p| under(base, p))
            .filter(|p| {
                relative_to(base, p)
                    .map(|rel| matcher.is_match(rel))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        out.sort();
        Ok(out)
    }

    async fn real_path(&self, path: &str) -> AppResult<String> {
        let state = self.enter()?;
        if let Some(target) = state.links.get(path) {
            return Ok(target.clone());
        }
        Ok(normalize_path(path).to_string_lossy().into_owned())
    }

    async fn upload_stream(
        &self,
        path: &str,
        mode: u32,
        length: u64,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> AppResult<u64> {
        drop(self.enter()?);
        let mut buf = Vec::new();
        source
            .take(length)
            .read_to_end(&mut buf)
            .await
            .map_err(|err| AppError::remote(format!("read failed: {err}")))?;
        let written = buf.len() as u64;
        let mut state = self.state.lock().unwrap();
        state.files.insert(path.to_string(), buf);
        state.modes.insert(path.to_string(), mode);
        Ok(written)
    }

    async fn download_stream(&self, path: &str) -> AppResult<RemoteReader> {
        let mut state = self.enter()?;
        state.downloads.push(path.to_string());
        let content = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| AppError::remote(format!("no such file: {path}")))?;
        Ok(Box::new(Cursor::new(content)))
    }

    async fn unzip(&self, archive: &str, dest_dir: &str) -> AppResult<i32> {
        let mut state = self.enter()?;
        state.commands.push(format!("unzip {archive} -d {dest_dir}"));
        Ok(state.unzip_status)
    }

    async fn zip_directory(&self, dir: &str, archive: &str) -> AppResult<i32> {
        let mut state = self.enter()?;
        state.commands.push(format!("zip {archive} {dir}"));
        if state.zip_status != 0 {
            return Ok(state.zip_status);
        }
        // entries are named the way `zip -r -y` run from the parent names them; links
        // are stored as links, and an existing archive is added to
        let parent = dir.rsplit_once('/').map_or("", |(parent, _)| parent);
        let mut listing = state.files.get(archive).cloned().unwrap_or_default();
        for (path, content) in state.files.iter().filter(|(p, _)| under(dir, p)) {
            let entry = format!(".{}", &path[parent.len()..]);
            let line = match state.links.get(path) {
                Some(target) => format!("{entry} -> {target}\n"),
                None => format!("{entry}: {}\n", String::from_utf8_lossy(content)),
            };
            listing.extend_from_slice(line.as_bytes());
        }
        state.files.insert(archive.to_string(), listing);
        Ok(0)
    }
}

/// Pool handing out the same fake session; counts acquisitions and open guards.
pub struct FakePool(pub Arc<FakeCluster>);

#[async_trait]
impl SessionPoolPort for FakePool {
    async fn acquire(&self) -> AppResult<PooledSession> {
        let cluster = self.0.clone();
        cluster.acquired.fetch_add(1, Ordering::SeqCst);
        if cluster.state.lock().unwrap().fail_transport {
            return Err(AppError::with_message(
                AppErrorKind::Remote,
                codes::CONNECTION_FAILURE,
                "no route to host",
            ));
        }
        let outstanding = cluster.outstanding.clone();
        outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(PooledSession::new(
            cluster,
            Box::new(move || {
                outstanding.fetch_sub(1, Ordering::SeqCst);
            }),
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlPlaneCall {
    StateChange {
        system_id: String,
        state: JobState,
        message: Option<String>,
    },
    Lookup(String),
    SubmitFile {
        system_id: String,
        path: String,
        length: u64,
        content: Vec<u8>,
    },
    Completed {
        system_id: String,
        usage: Option<SimpleDuration>,
        success: bool,
    },
}

#[derive(Default)]
pub struct RecordingControlPlane {
    pub calls: Mutex<Vec<ControlPlaneCall>>,
    pub jobs: Mutex<HashMap<String, Job>>,
    pub failing_paths: Mutex<HashSet<String>>,
    pub fail_state_changes: Mutex<bool>,
}

impl RecordingControlPlane {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_job(&self, job: Job) {
        self.jobs.lock().unwrap().insert(job.system_id.clone(), job);
    }

    pub fn calls(&self) -> Vec<ControlPlaneCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn submitted_paths(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                ControlPlaneCall::SubmitFile { path, .. } => Some(path),
                _ => None,
            })
            .collect()
    }

    fn unavailable() -> AppError {
        AppError::with_message(
            AppErrorKind::ControlPlane,
            codes::CONTROL_PLANE_ERROR,
            "control plane unavailable",
        )
    }
}

#[async_trait]
impl ControlPlanePort for RecordingControlPlane {
    async fn request_state_change(
        &self,
        system_id: &str,
        state: JobState,
        message: Option<&str>,
    ) -> AppResult<()> {
        self.calls.lock().unwrap().push(ControlPlaneCall::StateChange {
            system_id: system_id.to_string(),
            state,
            message: message.map(str::to_string),
        });
        if *self.fail_state_changes.lock().unwrap() {
            return Err(Self::unavailable());
        }
        Ok(())
    }

    async fn lookup(&self, system_id: &str) -> AppResult<Job> {
        self.calls
            .lock()
            .unwrap()
            .push(ControlPlaneCall::Lookup(system_id.to_string()));
        self.jobs
            .lock()
            .unwrap()
            .get(system_id)
            .cloned()
            .ok_or_else(|| AppError::new(AppErrorKind::NotFound, codes::NOT_FOUND))
    }

    async fn submit_file(
        &self,
        system_id: &str,
        relative_path: &str,
        length: u64,
        mut content: ByteStream,
    ) -> AppResult<()> {
        let mut buf = Vec::new();
        content
            .read_to_end(&mut buf)
            .await
            .map_err(|_| Self::unavailable())?;
        self.calls.lock().unwrap().push(ControlPlaneCall::SubmitFile {
            system_id: system_id.to_string(),
            path: relative_path.to_string(),
            length,
            content: buf,
        });
        if self.failing_paths.lock().unwrap().contains(relative_path) {
            return Err(Self::unavailable());
        }
        Ok(())
    }

    async fn completed(
        &self,
        system_id: &str,
        usage: Option<SimpleDuration>,
        success: bool,
    ) -> AppResult<()> {
        self.calls.lock().unwrap().push(ControlPlaneCall::Completed {
            system_id: system_id.to_string(),
            usage,
            success,
        });
        Ok(())
    }
}

#[derive(Default)]
struct StoreState {
    jobs: BTreeMap<String, JobRecord>,
    failures: Vec<FailureRecord>,
}

#[derive(Default)]
pub struct InMemoryJobStore {
    state: Mutex<StoreState>,
}

impl InMemoryJobStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.state.lock().unwrap().failures.clone()
    }
}

#[async_trait]
impl JobStorePort for InMemoryJobStore {
    async fn record_submission_intent(&self, system_id: &str, working_dir: &str) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        let live = state
            .jobs
            .get(system_id)
            .is_some_and(|r| r.scheduler_id.is_some() && r.finished_at.is_none());
        if live {
            return Err(AppError::new(AppErrorKind::Conflict, codes::CONFLICT));
        }
        state.jobs.insert(
            system_id.to_string(),
            JobRecord {
                system_id: system_id.to_string(),
                working_dir: working_dir.to_string(),
                scheduler_id: None,
                state: JobState::Prepared,
                created_at: "now".to_string(),
                submitted_at: None,
                finished_at: None,
                terminal_state: None,
            },
        );
        Ok(())
    }

    async fn record_handle(&self, system_id: &str, handle: ExternalHandle) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .jobs
            .get_mut(system_id)
            .ok_or_else(|| AppError::new(AppErrorKind::NotFound, codes::NOT_FOUND))?;
        record.scheduler_id = Some(handle);
        record.state = JobState::Scheduled;
        record.submitted_at = Some("now".to_string());
        Ok(())
    }

    async fn get_job(&self, system_id: &str) -> AppResult<Option<JobRecord>> {
        Ok(self.state.lock().unwrap().jobs.get(system_id).cloned())
    }

    async fn system_id_for_handle(&self, handle: ExternalHandle) -> AppResult<Option<String>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .find(|r| r.scheduler_id == Some(handle))
            .map(|r| r.system_id.clone()))
    }

    async fn list_active_handles(&self) -> AppResult<Vec<ExternalHandle>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|r| r.finished_at.is_none())
            .filter_map(|r| r.scheduler_id)
            .collect())
    }

    async fn mark_finished(&self, handle: ExternalHandle, terminal_state: &str) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        for record in state.jobs.values_mut() {
            if record.scheduler_id == Some(handle) {
                record.finished_at = Some("now".to_string());
                record.terminal_state = Some(terminal_state.to_string());
                record.state = if terminal_state == "ENDED" {
                    JobState::Success
                } else {
                    JobState::Failure
                };
            }
        }
        Ok(())
    }

    async fn enqueue_failure(&self, failure: &NewFailure) -> AppResult<i64> {
        let mut state = self.state.lock().unwrap();
        let id = state.failures.len() as i64 + 1;
        state.failures.push(FailureRecord {
            id,
            system_id: failure.system_id.clone(),
            scheduler_id: failure.scheduler_id,
            stage: failure.stage.clone(),
            message: failure.message.clone(),
            created_at: "now".to_string(),
            delivered_at: None,
        });
        Ok(id)
    }

    async fn pending_failures(&self, limit: u32) -> AppResult<Vec<FailureRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .failures
            .iter()
            .filter(|f| f.delivered_at.is_none() && f.system_id.is_some())
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn mark_failure_delivered(&self, id: i64) -> AppResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(f) = state.failures.iter_mut().find(|f| f.id == id) {
            f.delivered_at = Some("now".to_string());
        }
        Ok(())
    }
}
