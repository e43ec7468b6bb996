// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use crate::app::errors::{AppError, AppErrorKind, AppResult, codes};
use crate::app::services::shell::sh_escape;
use crate::app::types::{ExternalHandle, SchedulerEventKind, SimpleDuration};

pub fn sbatch_command(script_path: &str) -> String {
    format!("sbatch {}", sh_escape(script_path))
}

/// One `sacct` call covering every handle. `-X` limits output to the allocation line of
/// each job so step lines (`123.batch`) do not appear.
pub fn status_query_command(handles: &[ExternalHandle]) -> String {
    let ids = handles
        .iter()
        .map(|h| h.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!("sacct --noheader --parsable2 -X --format=JobID,State --jobs={ids}")
}

pub fn accounting_command(handle: ExternalHandle) -> String {
    format!("sacct --noheader --parsable2 -X --format=Elapsed --jobs={handle}")
}

pub fn parse_job_id(line: &str) -> Option<i64> {
    // sbatch answers "Submitted batch job 11"; with --cluster it appends " on cluster X"
    let marker = "Submitted batch job ";
    let idx = line.find(marker)?;
    let after_job = &line[idx + marker.len()..];
    after_job.split_whitespace().next()?.parse::<i64>().ok()
}

/// `(handle, raw state)` pairs from a `JobID|State` listing. Lines whose JobID is not a
/// plain integer (steps, array members, heterogeneous components) are skipped.
pub fn parse_sacct_job_states(output: &str) -> Vec<(ExternalHandle, String)> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (id, state) = line.split_once('|')?;
            let id = id.trim();
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let id = id.parse::<i64>().ok()?;
            let state = state.split('|').next().unwrap_or(state).trim();
            if state.is_empty() {
                return None;
            }
            Some((ExternalHandle(id), state.to_string()))
        })
        .collect()
}

/// `CANCELLED by 1000` and `FAILED+` style decorations are dropped.
pub fn normalize_slurm_state(state: &str) -> String {
    let token = state
        .split(|c: char| c == '+' || c == ':' || c == '(' || c.is_whitespace())
        .next()
        .unwrap_or(state)
        .trim();
    token.to_ascii_uppercase()
}

/// Event to emit for a scheduler state. Queued and transitional states map to nothing.
pub fn event_kind_for_state(state: &str) -> Option<SchedulerEventKind> {
    match normalize_slurm_state(state).as_str() {
        "RUNNING" | "COMPLETING" => Some(SchedulerEventKind::Running),
        "COMPLETED" => Some(SchedulerEventKind::Ended),
        "TIMEOUT" => Some(SchedulerEventKind::Timeout),
        "FAILED" | "CANCELLED" | "NODE_FAIL" | "OUT_OF_MEMORY" | "BOOT_FAIL" | "DEADLINE"
        | "PREEMPTED" | "REVOKED" | "SPECIAL_EXIT" => Some(SchedulerEventKind::Failed),
        _ => None,
    }
}

/// Parses the `Elapsed` column (`[D-]HH:MM:SS`) of an accounting query.
pub fn parse_elapsed(output: &str) -> AppResult<SimpleDuration> {
    let line = output
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .ok_or_else(|| malformed_accounting("empty accounting output"))?;
    line.parse::<SimpleDuration>()
        .map_err(|err| malformed_accounting(err.to_string()))
}

fn malformed_accounting(message: impl Into<String>) -> AppError {
    AppError::with_message(
        AppErrorKind::MalformedAccounting,
        codes::MALFORMED_ACCOUNTING,
        message,
    )
}
