// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::sync::Arc;

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::ports::{RemoteSession, SessionPoolPort};
use crate::app::services::remote_path::JobLayout;
use crate::app::services::shell::sh_escape;
use crate::app::types::{Job, JobState, StdStreamsResponse, StreamWindow};

pub const MAX_LINES_PER_WINDOW: i64 = 1000;

/// Bounded reads of a running job's `stdout.txt` and `stderr.txt`.
pub struct LogTailService {
    pool: Arc<dyn SessionPoolPort>,
    layout: JobLayout,
}

struct Slice {
    text: String,
    next_line: u64,
}

impl LogTailService {
    pub fn new(pool: Arc<dyn SessionPoolPort>, layout: JobLayout) -> Self {
        Self { pool, layout }
    }

    /// Returns the requested windows. Jobs that are neither scheduled nor running get an
    /// empty response without touching the cluster; a window asking for no lines is skipped.
    #[tracing::instrument(
        name = "log_tail",
        level = "debug",
        skip(self, job),
        fields(system_id = %job.system_id)
    )]
    pub async fn follow_std_streams(
        &self,
        job: &Job,
        stdout: StreamWindow,
        stderr: StreamWindow,
    ) -> AppResult<StdStreamsResponse> {
        let mut response = StdStreamsResponse {
            stdout_next_line: stdout.start,
            stderr_next_line: stderr.start,
            ..StdStreamsResponse::default()
        };
        if !matches!(job.state, JobState::Running | JobState::Scheduled) {
            return Ok(response);
        }
        if stdout.lines <= 0 && stderr.lines <= 0 {
            return Ok(response);
        }

        let stdout_path = self.layout.stdout_path(&job.system_id)?;
        let stderr_path = self.layout.stderr_path(&job.system_id)?;
        let session = self.pool.acquire().await?;

        if stdout.lines > 0 {
            let slice = read_window(&*session, &stdout_path, stdout).await?;
            response.stdout = slice.text;
            response.stdout_next_line = slice.next_line;
        }
        if stderr.lines > 0 {
            let slice = read_window(&*session, &stderr_path, stderr).await?;
            response.stderr = slice.text;
            response.stderr_next_line = slice.next_line;
        }
        Ok(response)
    }
}

pub fn window_command(path: &str, window: StreamWindow) -> String {
    let count = window.lines.clamp(1, MAX_LINES_PER_WINDOW);
    format!(
        "tail -n +{} -- {} | head -n {count}",
        window.start.saturating_add(1),
        sh_escape(path)
    )
}

/// `start + max(1, newlines in the slice)`.
pub fn next_line(start: u64, text: &str) -> u64 {
    let newlines = text.bytes().filter(|b| *b == b'\n').count() as u64;
    start.saturating_add(newlines.max(1))
}

async fn read_window(
    session: &dyn RemoteSession,
    path: &str,
    window: StreamWindow,
) -> AppResult<Slice> {
    let capture = session.exec_capture(&window_command(path, window)).await?;
    if capture.exit_code != 0 {
        return Err(AppError::with_message(
            AppErrorKind::Remote,
            codes::REMOTE_ERROR,
            format!("reading {path} exited with status {}", capture.exit_code),
        )
        .with_context(capture.stderr_text().trim().to_string()));
    }
    let text = capture.stdout_text();
    let next_line = next_line(window.start, &text);
    Ok(Slice { text, next_line })
}
