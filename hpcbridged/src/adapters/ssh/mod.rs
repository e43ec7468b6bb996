// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{ExecCapture, RemoteFileStat, RemoteReader, RemoteSession};
use crate::app::services::output_glob::compile_output_glob;
use crate::app::services::shell::sh_escape;

mod pool;
mod session;

pub use pool::SshSessionPool;
pub use session::{AuthenticationFailure, SessionManager, SshParams};

fn ssh_error_code(err: &anyhow::Error) -> &'static str {
    if err.chain().any(|cause| cause.is::<AuthenticationFailure>()) {
        codes::AUTHENTICATION_FAILURE
    } else {
        codes::CONNECTION_FAILURE
    }
}

fn map_exec_error(err: anyhow::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::Remote,
        codes::REMOTE_ERROR,
        format!("ssh exec failed: {err}"),
    )
}

fn map_sftp_error(err: anyhow::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::Remote,
        codes::REMOTE_ERROR,
        format!("sftp failed: {err:#}"),
    )
}

pub(crate) fn map_connect_error(err: anyhow::Error) -> AppError {
    AppError::with_message(
        AppErrorKind::Remote,
        ssh_error_code(&err),
        format!("ssh connect failed: {err:#}"),
    )
}

fn timed_out(op: &str, limit: Duration) -> AppError {
    AppError::with_message(
        AppErrorKind::Remote,
        codes::TIMEOUT,
        format!("{op} timed out after {}s", limit.as_secs()),
    )
}

/// `RemoteSession` over one pooled SSH connection. Every operation runs under the
/// command timeout; an elapsed timeout drops the in-flight channel.
pub struct SshRemoteSession {
    manager: Arc<SessionManager>,
    timeout: Duration,
}

impl SshRemoteSession {
    pub fn new(manager: Arc<SessionManager>, timeout: Duration) -> Self {
        Self { manager, timeout }
    }

    async fn bounded<T, F>(&self, op: &str, fut: F) -> AppResult<T>
    where
        F: Future<Output = AppResult<T>> + Send,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, timeout_secs = self.timeout.as_secs(), "remote call timed out");
                Err(timed_out(op, self.timeout))
            }
        }
    }

    async fn run_status(&self, op: &str, command: String) -> AppResult<i32> {
        let capture = self.exec_capture(&command).await?;
        if capture.exit_code != 0 {
            tracing::debug!(
                op,
                exit_code = capture.exit_code,
                stderr = %capture.stderr_text().trim(),
                "remote command failed"
            );
        }
        Ok(capture.exit_code)
    }
}

fn rm_command(path: &str) -> String {
    format!("rm -rf -- {}", sh_escape(path))
}

fn unzip_command(archive: &str, dest_dir: &str) -> String {
    format!("unzip -o -q {} -d {}", sh_escape(archive), sh_escape(dest_dir))
}

/// Archive entries are stored relative to the directory's parent. `-y` stores symlinks as
/// links so nothing outside the directory ends up in the archive.
fn zip_command(dir: &str, archive: &str) -> String {
    let trimmed = dir.trim_end_matches('/');
    let (parent, name) = match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/", name),
        Some((parent, name)) => (parent, name),
        None => (".", trimmed),
    };
    format!(
        "cd {} && zip -r -q -y {} {}",
        sh_escape(parent),
        sh_escape(archive),
        sh_escape(&format!("./{name}"))
    )
}

fn join_remote(base: &str, relative: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

#[async_trait]
impl RemoteSession for SshRemoteSession {
    #[tracing::instrument(name = "ssh", level = "debug", skip(self, command), fields(op = "exec_capture"))]
    async fn exec_capture(&self, command: &str) -> AppResult<ExecCapture> {
        self.bounded("exec", async {
            self.manager
                .exec_capture(command)
                .await
                .map_err(map_exec_error)
        })
        .await
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self, paths), fields(op = "mkdir"))]
    async fn mkdir(&self, paths: &[&str]) -> AppResult<i32> {
        self.bounded("mkdir", async {
            self.manager
                .ensure_remote_dirs(paths)
                .await
                .map_err(map_sftp_error)
        })
        .await
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "rm"))]
    async fn rm(&self, path: &str) -> AppResult<i32> {
        self.run_status("rm", rm_command(path)).await
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "stat"))]
    async fn stat(&self, path: &str) -> AppResult<Option<RemoteFileStat>> {
        self.bounded("stat", async {
            self.manager.stat(path).await.map_err(map_sftp_error)
        })
        .await
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "list_glob"))]
    async fn list_glob(&self, base: &str, pattern: &str) -> AppResult<Vec<String>> {
        let matcher = compile_output_glob(pattern)?;
        let entries = self
            .bounded("list_glob", async {
                self.manager.walk(base).await.map_err(map_sftp_error)
            })
            .await?;
        let mut matches: Vec<String> = entries
            .into_iter()
            .filter(|entry| matcher.is_match(&entry.relative))
            .map(|entry| join_remote(base, &entry.relative))
            .collect();
        matches.sort();
        Ok(matches)
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "real_path"))]
    async fn real_path(&self, path: &str) -> AppResult<String> {
        self.bounded("real_path", async {
            self.manager.canonicalize(path).await.map_err(map_sftp_error)
        })
        .await
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self, source), fields(op = "upload"))]
    async fn upload_stream(
        &self,
        path: &str,
        mode: u32,
        length: u64,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> AppResult<u64> {
        self.bounded("upload", async {
            self.manager
                .upload(path, mode, length, source)
                .await
                .map_err(map_sftp_error)
        })
        .await
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "download"))]
    async fn download_stream(&self, path: &str) -> AppResult<RemoteReader> {
        self.bounded("download", async {
            self.manager.open_reader(path).await.map_err(map_sftp_error)
        })
        .await
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "unzip"))]
    async fn unzip(&self, archive: &str, dest_dir: &str) -> AppResult<i32> {
        self.run_status("unzip", unzip_command(archive, dest_dir))
            .await
    }

    #[tracing::instrument(name = "ssh", level = "debug", skip(self), fields(op = "zip"))]
    async fn zip_directory(&self, dir: &str, archive: &str) -> AppResult<i32> {
        self.run_status("zip", zip_command(dir, archive)).await
    }
}
