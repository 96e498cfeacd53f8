//! Inline pipeline run: `buildpipe run`.

use std::sync::Arc;

use anyhow::{Context, Result};
use buildpipe::config::BuildpipeConfig;
use buildpipe::pipeline::{Orchestrator, PipelinePayload};
use buildpipe::sandbox::SandboxJobManager;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Run one pipeline in-process and print the report as JSON.
pub async fn cmd_run(config: &BuildpipeConfig, project_id: String, prompt: String) -> Result<()> {
    let payload = PipelinePayload::new(project_id, prompt);
    payload.validate().map_err(anyhow::Error::msg)?;

    let sandbox = Arc::new(SandboxJobManager::from_settings(&config.sandbox));
    let orchestrator = Orchestrator::from_config(config, sandbox.clone())?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        let sandbox = sandbox.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling pipeline run");
                cancel.cancel();
                sandbox.shutdown();
            }
        });
    }

    let report = orchestrator.run(&payload, cancel).await?;
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize pipeline report")?;
    println!("{}", json);
    Ok(())
}
