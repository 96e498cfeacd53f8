use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use buildpipe::config::BuildpipeConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "buildpipe")]
#[command(version, about = "AI-assisted build pipeline over sandboxed container jobs")]
pub struct Cli {
    /// Log at debug level (RUST_LOG takes precedence)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Directory holding `.buildpipe/config.toml` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API and the pipeline worker pool
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value = "3141")]
        port: u16,
        /// Enable permissive CORS for a local frontend
        #[arg(long)]
        dev: bool,
    },
    /// Run one pipeline inline and print its report as JSON
    Run {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        prompt: String,
    },
    /// Submit a pipeline request to the queue and print its id
    Enqueue {
        #[arg(long)]
        project_id: String,
        #[arg(long)]
        prompt: String,
    },
    /// Show the state of a queued pipeline request
    Status {
        /// Queue job id returned by `enqueue`
        id: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();
    buildpipe::logging::init(cli.verbose, cli.log_json);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = BuildpipeConfig::load(&project_dir)?;

    match cli.command {
        Commands::Serve { host, port, dev } => cmd::cmd_serve(config, host, port, dev).await?,
        Commands::Run { project_id, prompt } => cmd::cmd_run(&config, project_id, prompt).await?,
        Commands::Enqueue { project_id, prompt } => cmd::cmd_enqueue(&config, project_id, prompt).await?,
        Commands::Status { id } => cmd::cmd_status(&config, id).await?,
    }

    Ok(())
}
