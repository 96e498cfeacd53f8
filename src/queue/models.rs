use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pipeline::PipelinePayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid queue state: {}", s)),
        }
    }
}

/// One unit of work in the durable queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: i64,
    pub payload: PipelinePayload,
    pub state: QueueState,
    pub attempts: u32,
    pub max_attempts: u32,
    /// The serialized `PipelineReport` once completed.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Public view returned by status lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub state: QueueState,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl From<QueueJob> for JobStatusView {
    fn from(job: QueueJob) -> Self {
        Self {
            state: job.state,
            result: job.result,
            error: job.error,
        }
    }
}
