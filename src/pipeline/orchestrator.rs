use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::capability::{CliGenerator, DeployTrigger, FileWriter, HttpDeployTrigger, HttpFileWriter, LocalFileWriter};
use super::context::{PipelineContext, PipelinePayload};
use super::models::PipelineReport;
use super::stages::{self, StageEnv, StageSettings, summarize::RunOutcome};
use crate::config::BuildpipeConfig;
use crate::errors::PipelineError;
use crate::sandbox::SandboxRunner;
use crate::workspace::Workspace;

/// Sequences the stages of one run:
/// analyze → plan → execute → test → [fix] → summarize → [deploy].
///
/// Stage failures are captured in the stage results; only cancellation
/// aborts a run.
pub struct Orchestrator {
    env: StageEnv,
    deploy: Option<Arc<dyn DeployTrigger>>,
}

impl Orchestrator {
    pub fn new(env: StageEnv) -> Self {
        Self { env, deploy: None }
    }

    /// Wire the configured capabilities around a sandbox runner.
    ///
    /// With a `base_url`, files are written and deployments triggered over
    /// HTTP; without one, files land in the local workspace and deployment
    /// is unavailable.
    pub fn from_config(config: &BuildpipeConfig, sandbox: Arc<dyn SandboxRunner>) -> Result<Self> {
        let p = &config.pipeline;
        let generator = Arc::new(CliGenerator::new(
            &p.generator_cmd,
            Duration::from_secs(p.generator_timeout_secs),
            p.generator_retries,
        ));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        let settings = StageSettings::from_config(config);
        let files: Arc<dyn FileWriter> = match (&p.base_url, &settings.host_workspace) {
            (Some(base), _) => Arc::new(HttpFileWriter::new(client.clone(), base)),
            (None, Some(workspace)) => Arc::new(LocalFileWriter::new(workspace.clone())),
            (None, None) => Arc::new(LocalFileWriter::new(Workspace::new(&p.workspace_dir))),
        };

        let env = StageEnv {
            generator,
            files,
            sandbox,
            settings,
        };
        let mut orchestrator = Self::new(env);

        match (&p.base_url, p.auto_deploy) {
            (Some(base), true) => {
                orchestrator = orchestrator.with_deploy(Arc::new(HttpDeployTrigger::new(client, base)));
            }
            (None, true) => warn!("auto_deploy is enabled but no base_url is configured; deployment disabled"),
            _ => {}
        }
        Ok(orchestrator)
    }

    /// Trigger a deployment after every completed run.
    pub fn with_deploy(mut self, deploy: Arc<dyn DeployTrigger>) -> Self {
        self.deploy = Some(deploy);
        self
    }

    pub async fn run(
        &self,
        payload: &PipelinePayload,
        cancel: CancellationToken,
    ) -> Result<PipelineReport, PipelineError> {
        let mut ctx = PipelineContext::new(payload, cancel);
        let env = &self.env;
        info!(project_id = %ctx.project_id, "pipeline run started");

        checkpoint(&mut ctx, "analyze")?;
        let analysis = stages::analyze(&mut ctx, env).await;

        checkpoint(&mut ctx, "plan")?;
        let plan = stages::plan(&mut ctx, env, &analysis).await;

        checkpoint(&mut ctx, "execute")?;
        let execution = stages::execute(&mut ctx, env, &plan).await;

        checkpoint(&mut ctx, "test")?;
        let test = stages::test(&mut ctx, env, &execution).await;

        let fix = if test.passed {
            None
        } else {
            checkpoint(&mut ctx, "fix")?;
            Some(stages::fix(&mut ctx, env, &test).await)
        };

        checkpoint(&mut ctx, "summarize")?;
        let summary = stages::summarize(
            &mut ctx,
            env,
            RunOutcome {
                execution: &execution,
                test: &test,
                fix: fix.as_ref(),
            },
        )
        .await;

        let deployment = match &self.deploy {
            Some(deploy) => {
                ctx.log("deploy:start");
                let outcome = deploy.trigger(&ctx.project_id).await;
                if outcome.triggered {
                    ctx.log("deploy:triggered");
                } else {
                    warn!(project_id = %ctx.project_id, error = ?outcome.error, "deployment not triggered");
                    ctx.log("deploy:failed");
                }
                Some(outcome)
            }
            None => None,
        };

        info!(
            project_id = %ctx.project_id,
            status = %summary.overall_status,
            "pipeline run finished"
        );

        Ok(PipelineReport {
            project_id: ctx.project_id.clone(),
            overall_status: summary.overall_status,
            analysis,
            plan,
            execution,
            test,
            fix,
            summary,
            deployment,
            logs: ctx.into_logs(),
        })
    }
}

/// Bail out if the run was cancelled, otherwise record the stage marker.
fn checkpoint(ctx: &mut PipelineContext, stage: &str) -> Result<(), PipelineError> {
    if ctx.is_cancelled() {
        warn!(project_id = %ctx.project_id, stage, "pipeline run cancelled");
        return Err(PipelineError::Cancelled {
            stage: stage.to_string(),
        });
    }
    ctx.log(format!("{}:start", stage));
    Ok(())
}
