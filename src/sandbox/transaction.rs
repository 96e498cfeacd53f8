//! All-or-nothing command sequences against a project directory.
//!
//! The project directory is snapshotted, each step runs as a sandbox job with
//! the directory mounted, and the first failing step restores the snapshot.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::manager::SandboxRunner;
use super::spec::{NetworkMode, SandboxJobSpec};
use crate::config::BuildpipeConfig;
use crate::workspace::{Snapshot, Workspace};

/// One command of a transaction, executed directly (no shell).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionStep {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl TransactionStep {
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub rolled_back: bool,
    /// Combined output of every step that ran, in order.
    pub logs: Vec<String>,
}

pub struct SandboxTransaction {
    workspace: Workspace,
    image: String,
    workdir: String,
    network: NetworkMode,
    step_timeout: Duration,
}

impl SandboxTransaction {
    pub fn new(workspace: Workspace, image: impl Into<String>, workdir: impl Into<String>) -> Self {
        Self {
            workspace,
            image: image.into(),
            workdir: workdir.into(),
            network: NetworkMode::default(),
            step_timeout: Duration::from_secs(300),
        }
    }

    pub fn from_config(config: &BuildpipeConfig) -> Self {
        Self::new(
            Workspace::resolve(&config.pipeline.workspace_dir),
            &config.sandbox.image,
            &config.sandbox.workdir,
        )
        .with_network(config.sandbox.network)
        .with_step_timeout(config.sandbox.step_timeout())
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    fn step_spec(&self, image: &str, host_dir: &str, step: &TransactionStep) -> SandboxJobSpec {
        SandboxJobSpec::new(image, &step.cmd)
            .with_args(step.args.iter().cloned())
            .with_workdir(&self.workdir)
            .with_network(self.network)
            .with_mount(host_dir, &self.workdir, false)
    }

    /// Run `steps` in order against the project's directory. A failed step
    /// ends the run with `ok: false` after the directory is restored; an
    /// `Err` means the snapshot could not be taken or put back.
    pub async fn run(
        &self,
        runner: &dyn SandboxRunner,
        project_id: &str,
        steps: &[TransactionStep],
        image: Option<&str>,
    ) -> Result<TransactionOutcome> {
        let dir = self.workspace.project_dir(project_id)?;
        let snapshot = Snapshot::take(&dir).await?;
        let host_dir = dir.to_string_lossy();
        let image = image.unwrap_or(self.image.as_str());
        info!(project_id, steps = steps.len(), snapshot_bytes = snapshot.size_bytes(), "transaction started");

        let mut logs = Vec::with_capacity(steps.len());
        for step in steps {
            let outcome = runner
                .run(self.step_spec(image, &host_dir, step), self.step_timeout)
                .await;
            logs.push(outcome.output.clone());
            if outcome.succeeded() {
                continue;
            }

            warn!(project_id, cmd = %step.cmd, exit_code = ?outcome.exit_code, timed_out = outcome.timed_out, "transaction step failed, restoring");
            snapshot
                .restore()
                .await
                .with_context(|| format!("rollback failed after step '{}'", step.cmd))?;
            return Ok(TransactionOutcome {
                ok: false,
                error: Some(format!("step failed: {}", step.cmd)),
                rolled_back: true,
                logs,
            });
        }

        info!(project_id, "transaction committed");
        Ok(TransactionOutcome {
            ok: true,
            error: None,
            rolled_back: false,
            logs,
        })
    }
}
