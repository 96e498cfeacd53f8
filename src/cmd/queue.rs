//! Queue commands: `buildpipe enqueue` and `buildpipe status`.

use anyhow::{Context, Result};
use buildpipe::config::BuildpipeConfig;
use buildpipe::pipeline::PipelinePayload;
use buildpipe::queue::JobQueue;

pub async fn cmd_enqueue(config: &BuildpipeConfig, project_id: String, prompt: String) -> Result<()> {
    let queue = JobQueue::connect(&config.queue).await?;
    let id = queue.enqueue(PipelinePayload::new(project_id, prompt)).await?;
    println!("{}", id);
    Ok(())
}

pub async fn cmd_status(config: &BuildpipeConfig, id: i64) -> Result<()> {
    let queue = JobQueue::connect(&config.queue).await?;
    let status = queue.status(id).await?;
    let json = serde_json::to_string_pretty(&status).context("Failed to serialize job status")?;
    println!("{}", json);
    Ok(())
}
