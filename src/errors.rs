//! Typed error hierarchy for buildpipe.
//!
//! Three top-level enums cover the three subsystems:
//! - `SandboxError`: sandbox job spec validation and engine failures
//! - `QueueError`: durable queue access failures
//! - `PipelineError`: orchestrator-level faults that abort a run

use thiserror::Error;

/// Errors from the sandbox subsystem.
///
/// These never escape `SandboxJobManager::start()`; they are rendered into the
/// job log of an `error`-status job instead.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox spec field '{field}' must not be empty")]
    EmptyField { field: &'static str },

    #[error("Invalid CPU limit '{value}': expected a positive number")]
    InvalidCpus { value: String },

    #[error("Invalid memory limit '{value}': expected e.g. 512m or 1g")]
    InvalidMemory { value: String },

    #[error("Invalid mount '{host}:{target}': host and target paths are required")]
    InvalidMount { host: String, target: String },

    #[error("Failed to spawn container engine '{engine}': {source}")]
    SpawnFailed {
        engine: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the durable queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue job {id} not found")]
    JobNotFound { id: i64 },

    #[error("Queue database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("Queue database lock poisoned")]
    LockPoisoned,

    #[error("Invalid pipeline payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors that abort a pipeline run. Stage-local failures are captured in the
/// stage result records and never surface here.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Pipeline run cancelled before stage '{stage}'")]
    Cancelled { stage: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
