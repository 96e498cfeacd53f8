use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::warn;

use crate::sandbox::spec::NetworkMode;

/// Directory (relative to the project root) holding config, queue DB and workspace.
pub const CONFIG_DIR: &str = ".buildpipe";

/// Settings for sandbox jobs launched by the pipeline stages.
#[derive(Debug, Clone)]
pub struct SandboxSettings {
    /// Container engine binary, invoked as `<engine> run ...`.
    pub engine: String,
    pub image: String,
    pub workdir: String,
    pub network: NetworkMode,
    pub max_log_lines: usize,
    /// Upper bound on how long a pipeline step waits for its sandbox job.
    pub step_timeout_secs: u64,
    pub retain_max_jobs: Option<usize>,
    pub retain_max_age_secs: Option<u64>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            engine: "docker".to_string(),
            image: "node:18-alpine".to_string(),
            workdir: "/workspace".to_string(),
            network: NetworkMode::Bridge,
            max_log_lines: 5000,
            step_timeout_secs: 300,
            retain_max_jobs: Some(1000),
            retain_max_age_secs: Some(3600),
        }
    }
}

impl SandboxSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.step_timeout_secs)
    }
}

/// Settings for the durable pipeline queue and its worker pool.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Connection string: `sqlite://<path>`, a bare path, or `:memory:`.
    pub url: String,
    pub workers: usize,
    pub max_attempts: u32,
    pub poll_interval_ms: u64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            url: format!("sqlite://{}/queue.db", CONFIG_DIR),
            workers: 2,
            max_attempts: 1,
            poll_interval_ms: 1000,
        }
    }
}

/// Where the queue database lives.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueTarget {
    Memory,
    File(PathBuf),
}

impl QueueSettings {
    pub fn target(&self) -> QueueTarget {
        let raw = self.url.trim();
        let rest = raw.strip_prefix("sqlite://").unwrap_or(raw);
        match rest {
            "" | ":memory:" | "sqlite::memory:" => QueueTarget::Memory,
            path => QueueTarget::File(PathBuf::from(path)),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Settings for the pipeline's external collaborators.
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub auto_deploy: bool,
    /// Base URL of the file-write capability and deployment hook.
    /// When unset, files are written into `workspace_dir` instead.
    pub base_url: Option<String>,
    pub generator_cmd: String,
    pub generator_timeout_secs: u64,
    pub generator_retries: u32,
    pub workspace_dir: PathBuf,
    pub package_manager: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            auto_deploy: false,
            base_url: None,
            generator_cmd: "claude".to_string(),
            generator_timeout_secs: 120,
            generator_retries: 1,
            workspace_dir: PathBuf::from(CONFIG_DIR).join("workspace"),
            package_manager: "npm".to_string(),
        }
    }
}

/// Full runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct BuildpipeConfig {
    pub sandbox: SandboxSettings,
    pub queue: QueueSettings,
    pub pipeline: PipelineSettings,
}

/// Raw TOML structure for `.buildpipe/config.toml`
#[derive(Debug, Default, Deserialize)]
struct ConfigToml {
    sandbox: Option<SandboxSection>,
    queue: Option<QueueSection>,
    pipeline: Option<PipelineSection>,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    engine: Option<String>,
    image: Option<String>,
    workdir: Option<String>,
    network: Option<NetworkMode>,
    max_log_lines: Option<usize>,
    step_timeout_secs: Option<u64>,
    retain_max_jobs: Option<usize>,
    retain_max_age_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct QueueSection {
    url: Option<String>,
    workers: Option<usize>,
    max_attempts: Option<u32>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct PipelineSection {
    auto_deploy: Option<bool>,
    base_url: Option<String>,
    generator_cmd: Option<String>,
    generator_timeout_secs: Option<u64>,
    generator_retries: Option<u32>,
    workspace_dir: Option<PathBuf>,
    package_manager: Option<String>,
}

impl BuildpipeConfig {
    /// Load config from `.buildpipe/config.toml` in the project directory, then
    /// apply environment overrides. Returns defaults if the file doesn't exist.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(project_dir)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load only the TOML file, without environment overrides.
    pub fn load_file(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_DIR).join("config.toml");
        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let raw: ConfigToml = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;

        let mut config = Self::default();
        config.merge(raw);
        Ok(config)
    }

    fn merge(&mut self, raw: ConfigToml) {
        if let Some(s) = raw.sandbox {
            let sandbox = &mut self.sandbox;
            if let Some(engine) = s.engine {
                sandbox.engine = engine;
            }
            if let Some(image) = s.image {
                sandbox.image = image;
            }
            if let Some(workdir) = s.workdir {
                sandbox.workdir = workdir;
            }
            if let Some(network) = s.network {
                sandbox.network = network;
            }
            if let Some(max) = s.max_log_lines {
                sandbox.max_log_lines = max.max(1);
            }
            if let Some(timeout) = s.step_timeout_secs {
                sandbox.step_timeout_secs = timeout;
            }
            if s.retain_max_jobs.is_some() {
                sandbox.retain_max_jobs = s.retain_max_jobs;
            }
            if s.retain_max_age_secs.is_some() {
                sandbox.retain_max_age_secs = s.retain_max_age_secs;
            }
        }

        if let Some(q) = raw.queue {
            if let Some(url) = q.url {
                self.queue.url = url;
            }
            if let Some(workers) = q.workers {
                self.queue.workers = workers.max(1);
            }
            if let Some(attempts) = q.max_attempts {
                self.queue.max_attempts = attempts.max(1);
            }
            if let Some(interval) = q.poll_interval_ms {
                self.queue.poll_interval_ms = interval;
            }
        }

        if let Some(p) = raw.pipeline {
            let pipeline = &mut self.pipeline;
            if let Some(auto_deploy) = p.auto_deploy {
                pipeline.auto_deploy = auto_deploy;
            }
            if p.base_url.is_some() {
                pipeline.base_url = p.base_url;
            }
            if let Some(cmd) = p.generator_cmd {
                pipeline.generator_cmd = cmd;
            }
            if let Some(timeout) = p.generator_timeout_secs {
                pipeline.generator_timeout_secs = timeout;
            }
            if let Some(retries) = p.generator_retries {
                pipeline.generator_retries = retries;
            }
            if let Some(dir) = p.workspace_dir {
                pipeline.workspace_dir = dir;
            }
            if let Some(pm) = p.package_manager {
                pipeline.package_manager = pm;
            }
        }
    }

    /// Apply environment overrides using the given lookup function.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("QUEUE_URL").filter(|v| !v.trim().is_empty()) {
            self.queue.url = url;
        }
        if let Some(flag) = lookup("PIPELINE_AUTO_DEPLOY") {
            self.pipeline.auto_deploy = matches!(flag.trim(), "1" | "true" | "yes");
        }
        if let Some(base) = lookup("PIPELINE_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.pipeline.base_url = Some(base.trim_end_matches('/').to_string());
        }
        if let Some(engine) = lookup("SANDBOX_ENGINE").filter(|v| !v.trim().is_empty()) {
            self.sandbox.engine = engine;
        }
        if let Some(cmd) = lookup("GENERATOR_CMD").filter(|v| !v.trim().is_empty()) {
            self.pipeline.generator_cmd = cmd;
        }
        if let Some(raw) = lookup("SANDBOX_NETWORK") {
            match raw.trim().parse::<NetworkMode>() {
                Ok(network) => self.sandbox.network = network,
                Err(e) => warn!(error = %e, "ignoring SANDBOX_NETWORK"),
            }
        }
    }
}
