use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::workspace::check_project_id;

/// Request accepted by the queue and the orchestrator. Immutable once enqueued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelinePayload {
    pub project_id: String,
    pub prompt: String,
}

impl PipelinePayload {
    pub fn new(project_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            prompt: prompt.into(),
        }
    }

    /// Reject payloads that cannot be run: blank fields, or a project id that
    /// is not a single plain path segment.
    pub fn validate(&self) -> Result<(), String> {
        if self.project_id.trim().is_empty() {
            return Err("projectId is required".to_string());
        }
        if self.prompt.trim().is_empty() {
            return Err("prompt is required".to_string());
        }
        check_project_id(&self.project_id)
    }
}

/// Per-run state threaded through every stage. Never shared across runs.
#[derive(Debug)]
pub struct PipelineContext {
    pub project_id: String,
    pub prompt: String,
    logs: Vec<String>,
    cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(payload: &PipelinePayload, cancel: CancellationToken) -> Self {
        Self {
            project_id: payload.project_id.clone(),
            prompt: payload.prompt.clone(),
            logs: Vec::new(),
            cancel,
        }
    }

    /// Append a progress marker. The log is append-only.
    pub fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        debug!(project_id = %self.project_id, "{}", line);
        self.logs.push(line);
    }

    pub fn logs(&self) -> &[String] {
        &self.logs
    }

    pub fn into_logs(self) -> Vec<String> {
        self.logs
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
