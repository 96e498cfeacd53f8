//! The six pipeline stages. Each is a free function over the run context, the
//! previous stage's result and a `StageEnv` of injected capabilities.

pub mod analyze;
pub mod execute;
pub mod fix;
pub mod plan;
pub mod summarize;

use std::sync::Arc;
use std::time::Duration;

use super::capability::{FileWriter, Generator};
use crate::config::BuildpipeConfig;
use crate::sandbox::{CommandOutcome, JobStatus, NetworkMode, SandboxJobSpec, SandboxRunner};
use crate::workspace::Workspace;

pub use analyze::analyze;
pub use execute::execute;
pub use fix::fix;
pub use plan::plan;
pub use summarize::summarize;
pub use self::test::test;

/// Knobs for sandboxed step execution.
#[derive(Debug, Clone)]
pub struct StageSettings {
    pub image: String,
    pub workdir: String,
    pub network: NetworkMode,
    pub step_timeout: Duration,
    pub package_manager: String,
    /// Host workspace whose project directory is mounted at `workdir`.
    pub host_workspace: Option<Workspace>,
}

impl StageSettings {
    pub fn from_config(config: &BuildpipeConfig) -> Self {
        let host_workspace = match config.pipeline.base_url {
            Some(_) => None,
            None => Some(Workspace::resolve(&config.pipeline.workspace_dir)),
        };
        Self {
            image: config.sandbox.image.clone(),
            workdir: config.sandbox.workdir.clone(),
            network: config.sandbox.network,
            step_timeout: config.sandbox.step_timeout(),
            package_manager: config.pipeline.package_manager.clone(),
            host_workspace,
        }
    }
}

impl Default for StageSettings {
    fn default() -> Self {
        Self::from_config(&BuildpipeConfig::default())
    }
}

/// Capabilities shared by every stage of a run.
#[derive(Clone)]
pub struct StageEnv {
    pub generator: Arc<dyn Generator>,
    pub files: Arc<dyn FileWriter>,
    pub sandbox: Arc<dyn SandboxRunner>,
    pub settings: StageSettings,
}

impl StageEnv {
    /// `sh -c <command>` in the project's sandbox. Fails for project ids
    /// that do not resolve to a directory inside the host workspace.
    pub fn command_spec(&self, project_id: &str, command: &str) -> anyhow::Result<SandboxJobSpec> {
        let s = &self.settings;
        let mut spec = SandboxJobSpec::shell(&s.image, command)
            .with_workdir(&s.workdir)
            .with_network(s.network);
        if let Some(workspace) = &s.host_workspace {
            let dir = workspace.project_dir(project_id)?;
            spec = spec.with_mount(dir.to_string_lossy(), &s.workdir, false);
        }
        Ok(spec)
    }

    /// Run one shell command to completion under the step timeout.
    pub async fn run_command(&self, project_id: &str, command: &str) -> CommandOutcome {
        match self.command_spec(project_id, command) {
            Ok(spec) => self.sandbox.run(spec, self.settings.step_timeout).await,
            Err(e) => CommandOutcome {
                job_id: String::new(),
                status: JobStatus::Error,
                exit_code: None,
                output: format!("[error] {:#}", e),
                timed_out: false,
            },
        }
    }
}
