use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::SandboxError;

pub const DEFAULT_CPUS: &str = "1";
pub const DEFAULT_MEMORY: &str = "1g";

static MEMORY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+(\.[0-9]+)?[bkmgBKMG]?$").expect("valid memory regex"));

/// Container network mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    None,
    Bridge,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bridge => "bridge",
        }
    }
}

impl std::fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "bridge" => Ok(Self::Bridge),
            _ => Err(format!("Invalid network mode: {}", s)),
        }
    }
}

/// A host path bind-mounted into the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mount {
    pub host: String,
    pub target: String,
    #[serde(default)]
    pub readonly: bool,
}

/// Immutable description of one sandboxed command execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SandboxJobSpec {
    pub image: String,
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

impl SandboxJobSpec {
    pub fn new(image: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            cmd: cmd.into(),
            ..Default::default()
        }
    }

    /// `sh -c <command>` in the given image.
    pub fn shell(image: impl Into<String>, command: impl Into<String>) -> Self {
        Self::new(image, "sh").with_args(["-c".to_string(), command.into()])
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_mount(mut self, host: impl Into<String>, target: impl Into<String>, readonly: bool) -> Self {
        self.mounts.push(Mount {
            host: host.into(),
            target: target.into(),
            readonly,
        });
        self
    }

    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    pub fn cpus(&self) -> &str {
        self.cpus.as_deref().unwrap_or(DEFAULT_CPUS)
    }

    pub fn memory(&self) -> &str {
        self.memory.as_deref().unwrap_or(DEFAULT_MEMORY)
    }

    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::EmptyField { field: "image" });
        }
        if self.cmd.trim().is_empty() {
            return Err(SandboxError::EmptyField { field: "cmd" });
        }

        let cpus = self.cpus();
        match cpus.trim().parse::<f64>() {
            Ok(n) if n > 0.0 && n.is_finite() => {}
            _ => {
                return Err(SandboxError::InvalidCpus {
                    value: cpus.to_string(),
                });
            }
        }

        let memory = self.memory();
        if !MEMORY_RE.is_match(memory.trim()) {
            return Err(SandboxError::InvalidMemory {
                value: memory.to_string(),
            });
        }

        for mount in &self.mounts {
            if mount.host.trim().is_empty() || mount.target.trim().is_empty() {
                return Err(SandboxError::InvalidMount {
                    host: mount.host.clone(),
                    target: mount.target.clone(),
                });
            }
        }

        Ok(())
    }

    /// Arguments passed to the container engine binary for this job.
    pub fn engine_args(&self, job_id: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            format!("job_{}", job_id),
            "--network".to_string(),
            self.network.to_string(),
            "--cpus".to_string(),
            self.cpus().trim().to_string(),
            "--memory".to_string(),
            self.memory().trim().to_string(),
        ];

        if let Some(workdir) = self.workdir.as_deref().filter(|w| !w.is_empty()) {
            args.push("-w".to_string());
            args.push(workdir.to_string());
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        for mount in &self.mounts {
            let ro = if mount.readonly { ":ro" } else { "" };
            args.push("-v".to_string());
            args.push(format!("{}:{}{}", mount.host, mount.target, ro));
        }

        args.push(self.image.clone());
        args.push(self.cmd.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}
