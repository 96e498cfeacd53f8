//! The multi-stage build pipeline and its external capabilities.

pub mod capability;
pub mod context;
pub mod models;
pub mod orchestrator;
pub mod stages;

pub use capability::{
    CliGenerator, DeployTrigger, FileWriter, Generator, HttpDeployTrigger, HttpFileWriter, LocalFileWriter,
};
pub use context::{PipelineContext, PipelinePayload};
pub use models::{OverallStatus, PipelineReport};
pub use orchestrator::Orchestrator;
pub use stages::{StageEnv, StageSettings};
