// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Scheduler-issued job id, returned by `sbatch` at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalHandle(pub i64);

impl fmt::Display for ExternalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulerEventKind {
    Running,
    Ended,
    Failed,
    Timeout,
}

impl SchedulerEventKind {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SchedulerEventKind::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SchedulerEventKind::Running => "RUNNING",
            SchedulerEventKind::Ended => "ENDED",
            SchedulerEventKind::Failed => "FAILED",
            SchedulerEventKind::Timeout => "TIMEOUT",
        }
    }
}

/// A lifecycle transition observed by the poll agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerEvent {
    Running(ExternalHandle),
    Ended(ExternalHandle),
    Failed(ExternalHandle),
    Timeout(ExternalHandle),
}

impl SchedulerEvent {
    pub fn new(kind: SchedulerEventKind, handle: ExternalHandle) -> Self {
        match kind {
            SchedulerEventKind::Running => SchedulerEvent::Running(handle),
            SchedulerEventKind::Ended => SchedulerEvent::Ended(handle),
            SchedulerEventKind::Failed => SchedulerEvent::Failed(handle),
            SchedulerEventKind::Timeout => SchedulerEvent::Timeout(handle),
        }
    }

    pub fn handle(&self) -> ExternalHandle {
        match *self {
            SchedulerEvent::Running(h)
            | SchedulerEvent::Ended(h)
            | SchedulerEvent::Failed(h)
            | SchedulerEvent::Timeout(h) => h,
        }
    }

    pub fn kind(&self) -> SchedulerEventKind {
        match self {
            SchedulerEvent::Running(_) => SchedulerEventKind::Running,
            SchedulerEvent::Ended(_) => SchedulerEventKind::Ended,
            SchedulerEvent::Failed(_) => SchedulerEventKind::Failed,
            SchedulerEvent::Timeout(_) => SchedulerEventKind::Timeout,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.kind().is_terminal()
    }
}

/// Wall-clock duration in the `HH:MM:SS` shape Slurm uses for limits and accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct SimpleDuration {
    pub hours: u32,
    pub minutes: u32,
    pub seconds: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDurationError(pub String);

impl fmt::Display for ParseDurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed duration '{}'", self.0)
    }
}

impl std::error::Error for ParseDurationError {}

impl SimpleDuration {
    pub fn new(hours: u32, minutes: u32, seconds: u32) -> Self {
        Self {
            hours,
            minutes,
            seconds,
        }
    }

    pub fn total_seconds(&self) -> u64 {
        self.hours as u64 * 3600 + self.minutes as u64 * 60 + self.seconds as u64
    }
}

impl fmt::Display for SimpleDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.hours, self.minutes, self.seconds
        )
    }
}

impl FromStr for SimpleDuration {
    type Err = ParseDurationError;

    /// Accepts `HH:MM:SS` and Slurm's `D-HH:MM:SS`; days are folded into hours.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseDurationError(s.to_string());
        let trimmed = s.trim();
        let (days, hms) = match trimmed.split_once('-') {
            Some((d, rest)) => (d.parse::<u32>().map_err(|_| err())?, rest),
            None => (0, trimmed),
        };

        let mut it = hms.split(':');
        let (h, m, sec) = (
            it.next().ok_or_else(err)?,
            it.next().ok_or_else(err)?,
            it.next().ok_or_else(err)?,
        );
        if it.next().is_some() {
            return Err(err());
        }
        let parse = |part: &str| -> Result<u32, ParseDurationError> {
            if part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()) {
                return Err(err());
            }
            part.parse::<u32>().map_err(|_| err())
        };
        let (h, m, sec) = (parse(h)?, parse(m)?, parse(sec)?);
        if m >= 60 || sec >= 60 {
            return Err(err());
        }
        let hours = days
            .checked_mul(24)
            .and_then(|d| d.checked_add(h))
            .ok_or_else(err)?;
        Ok(SimpleDuration::new(hours, m, sec))
    }
}

/// Lifecycle states understood by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Validated,
    Prepared,
    Scheduled,
    Running,
    Transferring,
    Success,
    Failure,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Validated => "VALIDATED",
            JobState::Prepared => "PREPARED",
            JobState::Scheduled => "SCHEDULED",
            JobState::Running => "RUNNING",
            JobState::Transferring => "TRANSFERRING",
            JobState::Success => "SUCCESS",
            JobState::Failure => "FAILURE",
        }
    }

    pub fn from_db(value: &str) -> Option<Self> {
        Some(match value {
            "VALIDATED" => JobState::Validated,
            "PREPARED" => JobState::Prepared,
            "SCHEDULED" => JobState::Scheduled,
            "RUNNING" => JobState::Running,
            "TRANSFERRING" => JobState::Transferring,
            "SUCCESS" => JobState::Success,
            "FAILURE" => JobState::Failure,
            _ => return None,
        })
    }
}

/// How the tool's container is started on the compute nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolBackend {
    Singularity,
    Udocker,
}

impl ToolBackend {
    /// Environment modules a backend needs regardless of what the tool declares.
    pub fn implied_modules(self) -> &'static [&'static str] {
        match self {
            ToolBackend::Singularity => &["singularity"],
            ToolBackend::Udocker => &["python", "udocker"],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tool {
    pub name: String,
    pub version: String,
    pub container: String,
    pub backend: ToolBackend,
    #[serde(default)]
    pub required_modules: Vec<String>,
}

/// One element of an application's command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InvocationToken {
    /// Literal argument written by the application author.
    Word { word: String },
    /// `prefix + value + suffix` as a single argument; omitted when an optional
    /// parameter has no value.
    Variable {
        name: String,
        #[serde(default)]
        prefix: String,
        #[serde(default)]
        suffix: String,
    },
    /// Emits `flag` when the boolean parameter `name` is true.
    Flag { name: String, flag: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ParameterValue {
    Text { value: String },
    Integer { value: i64 },
    FloatingPoint { value: f64 },
    Boolean { value: bool },
    /// A staged input file; `destination` is relative to the job's `files/` directory.
    InputFile { destination: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParameterSpec {
    pub name: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub default_value: Option<ParameterValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub name: String,
    pub version: String,
    pub tool: Tool,
    pub invocation: Vec<InvocationToken>,
    #[serde(default)]
    pub parameters: Vec<ParameterSpec>,
    #[serde(default)]
    pub output_file_globs: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRequest {
    pub nodes: u32,
    pub tasks_per_node: u32,
    pub max_time: SimpleDuration,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        Self {
            nodes: 1,
            tasks_per_node: 1,
            max_time: SimpleDuration::new(1, 0, 0),
        }
    }
}

/// A job as issued by the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub system_id: String,
    pub owner: String,
    pub application: Application,
    #[serde(default)]
    pub parameters: BTreeMap<String, ParameterValue>,
    #[serde(default)]
    pub resources: ResourceRequest,
    pub state: JobState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ArchiveKind {
    Zip,
}

/// A window into one of the job's log files. `start` is a zero-based line index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamWindow {
    pub start: u64,
    pub lines: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StdStreamsResponse {
    pub stdout: String,
    pub stderr: String,
    pub stdout_next_line: u64,
    pub stderr_next_line: u64,
}

/// Durable record tying a control-plane job to its scheduler handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub system_id: String,
    pub working_dir: String,
    pub scheduler_id: Option<ExternalHandle>,
    pub state: JobState,
    pub created_at: String,
    pub submitted_at: Option<String>,
    pub finished_at: Option<String>,
    pub terminal_state: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFailure {
    pub system_id: Option<String>,
    pub scheduler_id: Option<ExternalHandle>,
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub id: i64,
    pub system_id: Option<String>,
    pub scheduler_id: Option<ExternalHandle>,
    pub stage: String,
    pub message: String,
    pub created_at: String,
    pub delivered_at: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_duration_parses_and_formats() {
        let d: SimpleDuration = "01:30:00".parse().unwrap();
        assert_eq!(d, SimpleDuration::new(1, 30, 0));
        assert_eq!(d.to_string(), "01:30:00");
        assert_eq!(d.total_seconds(), 5400);
    }

    #[test]
    fn simple_duration_folds_days_into_hours() {
        let d: SimpleDuration = "2-03:04:05".parse().unwrap();
        assert_eq!(d, SimpleDuration::new(51, 4, 5));
    }

    #[test]
    fn simple_duration_rejects_malformed_values() {
        for raw in ["", "12:00", "aa:bb:cc", "01:61:00", "1:2:3:4", "-01:00:00", "+1:00:00"] {
            assert!(raw.parse::<SimpleDuration>().is_err(), "{raw} should fail");
        }
    }

    #[test]
    fn terminal_kinds() {
        let handle = ExternalHandle(7);
        assert!(!SchedulerEvent::Running(handle).is_terminal());
        assert!(SchedulerEvent::Ended(handle).is_terminal());
        assert!(SchedulerEvent::Failed(handle).is_terminal());
        assert!(SchedulerEvent::Timeout(handle).is_terminal());
        assert_eq!(SchedulerEvent::Timeout(handle).handle(), handle);
    }

    #[test]
    fn job_deserializes_from_control_plane_json() {
        let raw = r#"{
            "systemId": "job-42",
            "owner": "alice",
            "application": {
                "name": "figlet",
                "version": "1.0",
                "tool": {
                    "name": "figlet",
                    "version": "1.0",
                    "container": "ubuntu.sif",
                    "backend": "SINGULARITY"
                },
                "invocation": [
                    {"type": "word", "word": "figlet"},
                    {"type": "variable", "name": "text"}
                ],
                "parameters": [{"name": "text"}],
                "outputFileGlobs": ["*.txt"]
            },
            "parameters": {"text": {"type": "text", "value": "hi"}},
            "resources": {"nodes": 2, "tasksPerNode": 4, "maxTime": {"hours": 1, "minutes": 30, "seconds": 0}},
            "state": "RUNNING"
        }"#;
        let job: Job = serde_json::from_str(raw).unwrap();
        assert_eq!(job.system_id, "job-42");
        assert_eq!(job.application.tool.backend, ToolBackend::Singularity);
        assert_eq!(job.resources.nodes, 2);
        assert_eq!(job.state, JobState::Running);
        assert_eq!(
            job.parameters.get("text"),
            Some(&ParameterValue::Text {
                value: "hi".to_string()
            })
        );
    }
}
