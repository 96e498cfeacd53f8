use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::spec::SandboxJobSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Exited,
    Error,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Exited => "exited",
            Self::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered log lines capped at a fixed entry count; the oldest lines are
/// discarded once the cap is exceeded.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    lines: VecDeque<String>,
    cap: usize,
}

impl LogBuffer {
    pub fn new(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            lines: VecDeque::with_capacity(cap.min(256)),
            cap,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.cap {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.lines.iter().cloned().collect()
    }
}

/// Registry-owned mutable job record. Only the job manager writes to it.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub pid: Option<u32>,
    pub spec: SandboxJobSpec,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub logs: LogBuffer,
}

impl JobRecord {
    pub fn new(id: String, spec: SandboxJobSpec, max_log_lines: usize) -> Self {
        Self {
            id,
            pid: None,
            spec,
            status: JobStatus::Running,
            exit_code: None,
            started_at: Utc::now(),
            ended_at: None,
            logs: LogBuffer::new(max_log_lines),
        }
    }

    /// Record normal process completion. No-op once terminal.
    pub fn mark_exited(&mut self, exit_code: Option<i32>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Exited;
        self.exit_code = exit_code;
        self.ended_at = Some(Utc::now());
    }

    /// Record a launch failure or abnormal crash. No-op once terminal.
    pub fn mark_error(&mut self, message: &str) {
        if self.status.is_terminal() {
            return;
        }
        self.status = JobStatus::Error;
        self.exit_code = None;
        self.logs.push(format!("[error] {}", message));
        self.ended_at = Some(Utc::now());
    }

    pub fn snapshot(&self) -> SandboxJobState {
        SandboxJobState {
            id: self.id.clone(),
            pid: self.pid,
            spec: self.spec.clone(),
            status: self.status,
            exit_code: self.exit_code,
            started_at: self.started_at,
            ended_at: self.ended_at,
            logs: self.logs.to_vec(),
        }
    }
}

/// Read-only snapshot of a sandbox job handed to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxJobState {
    pub id: String,
    pub pid: Option<u32>,
    pub spec: SandboxJobSpec,
    pub status: JobStatus,
    pub exit_code: Option<i32>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub logs: Vec<String>,
}

impl SandboxJobState {
    pub fn output(&self) -> String {
        self.logs.join("\n")
    }
}
