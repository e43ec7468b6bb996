// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::app::errors::AppResult;

#[derive(Debug, Clone, Default)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFileStat {
    pub size: u64,
    pub is_dir: bool,
}

pub type RemoteReader = Box<dyn AsyncRead + Send + Unpin>;

#[async_trait]
/// Operations available on one authenticated connection to the cluster login node.
///
/// Methods returning `AppResult<i32>` report the remote exit status in `Ok`; `Err` is
/// reserved for transport failures. Operations on one session run sequentially.
pub trait RemoteSession: Send + Sync {
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture>;

    /// `mkdir -p` for every path, in one command.
    async fn mkdir(&self, paths: &[&str]) -> AppResult<i32>;

    /// `rm -rf` on the path.
    async fn rm(&self, path: &str) -> AppResult<i32>;

    /// `None` when nothing exists at `path`.
    async fn stat(&self, path: &str) -> AppResult<Option<RemoteFileStat>>;

    /// Paths under `base` (recursively) whose base-relative form matches `pattern`.
    async fn list_glob(&self, base: &str, pattern: &str) -> AppResult<Vec<String>>;

    /// Canonical absolute path with symlinks resolved.
    async fn real_path(&self, path: &str) -> AppResult<String>;

    /// Writes at most `length` bytes from `source` to `path` with `mode`, returning
    /// the number of bytes written.
    async fn upload_stream(
        &self,
        path: &str,
        mode: u32,
        length: u64,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> AppResult<u64>;

    async fn download_stream(&self, path: &str) -> AppResult<RemoteReader>;

    /// Extracts `archive` into `dest_dir`.
    async fn unzip(&self, archive: &str, dest_dir: &str) -> AppResult<i32>;

    /// Packs the directory at `dir` into `archive`.
    async fn zip_directory(&self, dir: &str, archive: &str) -> AppResult<i32>;
}

/// Source of scoped sessions. Every acquired session is returned when its guard drops.
#[async_trait]
pub trait SessionPoolPort: Send + Sync {
    async fn acquire(&self) -> AppResult<PooledSession>;
}

/// A session on loan from a pool. Dropping the guard hands the session back.
pub struct PooledSession {
    session: Arc<dyn RemoteSession>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl PooledSession {
    pub fn new(session: Arc<dyn RemoteSession>, release: Box<dyn FnOnce() + Send + Sync>) -> Self {
        Self {
            session,
            release: Some(release),
        }
    }
}

impl Deref for PooledSession {
    type Target = dyn RemoteSession;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref()
    }
}

impl fmt::Debug for PooledSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledSession")
            .field("released", &self.release.is_none())
            .finish()
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}
