//! Narrow interfaces to the pipeline's external collaborators.
//!
//! Stages only see these traits; the concrete implementations here shell out
//! to an LLM CLI or talk HTTP to the host application.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::{debug, warn};

use super::models::DeploymentOutcome;
use crate::workspace::Workspace;

/// Opaque text generation: `generate(system, prompt) -> text`.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Writes a project file on behalf of the `file` step kind and the fix stage.
#[async_trait]
pub trait FileWriter: Send + Sync {
    async fn write_file(&self, project_id: &str, path: &str, content: &str) -> Result<()>;
}

/// Fires a deployment for a finished run. Outcomes are reported, never raised.
#[async_trait]
pub trait DeployTrigger: Send + Sync {
    async fn trigger(&self, project_id: &str) -> DeploymentOutcome;
}

/// Generator backed by an LLM command-line tool (`claude --print` style).
pub struct CliGenerator {
    command: String,
    timeout: Duration,
    retries: u32,
}

impl CliGenerator {
    pub fn new(command: &str, timeout: Duration, retries: u32) -> Self {
        Self {
            command: command.to_string(),
            timeout,
            retries,
        }
    }

    async fn call_once(&self, system: &str, prompt: &str) -> Result<String> {
        let mut cmd = Command::new(&self.command);
        cmd.args(["--print", "--output-format", "text", "-p", prompt, "--system", system])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .with_context(|| format!("Generator timed out after {}s", self.timeout.as_secs()))?
            .with_context(|| format!("Failed to run generator command '{}'", self.command))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("Generator failed: {}", stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Generator for CliGenerator {
    async fn generate(&self, system: &str, prompt: &str) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.call_once(system, prompt).await {
                Ok(text) => return Ok(text),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    warn!(attempt, error = %e, "generator call failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Writes files through the host application's studio API.
pub struct HttpFileWriter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFileWriter {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl FileWriter for HttpFileWriter {
    async fn write_file(&self, project_id: &str, path: &str, content: &str) -> Result<()> {
        let url = format!("{}/api/studio/files", self.base_url);
        let response = self
            .client
            .put(&url)
            .json(&json!({ "projectId": project_id, "path": path, "content": content }))
            .send()
            .await
            .with_context(|| format!("Failed to reach {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Failed to update file {}: HTTP {}", path, status);
        }
        debug!(project_id, path, "file written via studio API");
        Ok(())
    }
}

/// Writes files under `<root>/<project_id>/` on the local disk.
pub struct LocalFileWriter {
    workspace: Workspace,
}

impl LocalFileWriter {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    /// Host directory holding a project's files.
    pub fn project_dir(&self, project_id: &str) -> Result<PathBuf> {
        self.workspace.project_dir(project_id)
    }
}

/// Accept only plain relative paths with no `..`, root or prefix components.
fn safe_relative(path: &str) -> Result<&Path> {
    let p = Path::new(path);
    if path.is_empty() || !p.components().all(|c| matches!(c, Component::Normal(_) | Component::CurDir)) {
        bail!("Refusing to write outside the project directory: '{}'", path);
    }
    Ok(p)
}

#[async_trait]
impl FileWriter for LocalFileWriter {
    async fn write_file(&self, project_id: &str, path: &str, content: &str) -> Result<()> {
        let target = self.project_dir(project_id)?.join(safe_relative(path)?);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(&target, content)
            .await
            .with_context(|| format!("Failed to write {}", target.display()))?;
        debug!(project_id, path = %target.display(), "file written");
        Ok(())
    }
}

/// POSTs `{projectId}` to `<base_url>/api/deploy/hooks`.
pub struct HttpDeployTrigger {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDeployTrigger {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl DeployTrigger for HttpDeployTrigger {
    async fn trigger(&self, project_id: &str) -> DeploymentOutcome {
        let url = format!("{}/api/deploy/hooks", self.base_url);
        match self
            .client
            .post(&url)
            .json(&json!({ "projectId": project_id }))
            .send()
            .await
        {
            Ok(resp) => {
                let status = resp.status();
                DeploymentOutcome {
                    triggered: status.is_success(),
                    status: Some(status.as_u16()),
                    error: (!status.is_success()).then(|| format!("Deploy hook returned HTTP {}", status)),
                }
            }
            Err(e) => {
                warn!(project_id, error = %e, "deploy hook unreachable");
                DeploymentOutcome {
                    triggered: false,
                    status: None,
                    error: Some(e.to_string()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;

    #[tokio::test]
    async fn test_local_writer_creates_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalFileWriter::new(Workspace::new(dir.path()));
        writer
            .write_file("p1", "src/components/App.tsx", "export {}")
            .await
            .unwrap();
        let written = std::fs::read_to_string(dir.path().join("p1/src/components/App.tsx")).unwrap();
        assert_eq!(written, "export {}");
    }

    #[tokio::test]
    async fn test_local_writer_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let writer = LocalFileWriter::new(Workspace::new(dir.path().join("ws")));
        assert!(writer.write_file("p1", "../../etc/passwd", "x").await.is_err());
        assert!(writer.write_file("p1", "/etc/passwd", "x").await.is_err());
        assert!(writer.write_file("..", "a.txt", "x").await.is_err());
        assert!(writer.write_file("/etc", "a.txt", "x").await.is_err());
        assert!(writer.write_file("p1:/etc", "a.txt", "x").await.is_err());
        assert!(writer.write_file("p1", "", "x").await.is_err());
    }

    #[tokio::test]
    async fn test_deploy_trigger_unreachable_is_reported() {
        let trigger = HttpDeployTrigger::new(reqwest::Client::new(), "http://127.0.0.1:1/");
        let outcome = trigger.trigger("p1").await;
        assert!(!outcome.triggered);
        assert!(outcome.error.is_some());
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> String {
        let path = dir.join("fake-llm");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_generator_returns_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), r#"echo '{"objectives": ["x"]}'"#);
        let generator = CliGenerator::new(&cmd, Duration::from_secs(10), 0);
        let text = generator.generate("sys", "prompt").await.unwrap();
        assert!(text.contains("objectives"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_generator_retries_then_fails() {
        let dir = tempfile::tempdir().unwrap();
        let counter = dir.path().join("calls");
        let cmd = script(
            dir.path(),
            &format!("echo call >> {}\necho boom >&2\nexit 1", counter.display()),
        );
        let generator = CliGenerator::new(&cmd, Duration::from_secs(10), 2);
        let err = generator.generate("sys", "prompt").await.unwrap_err();
        assert!(err.to_string().contains("boom"));
        let calls = std::fs::read_to_string(&counter).unwrap();
        assert_eq!(calls.lines().count(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_generator_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = script(dir.path(), "sleep 5");
        let generator = CliGenerator::new(&cmd, Duration::from_millis(100), 0);
        let err = generator.generate("sys", "prompt").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_cli_generator_missing_binary() {
        let generator = CliGenerator::new("/nonexistent/llm", Duration::from_secs(1), 0);
        assert!(generator.generate("s", "p").await.is_err());
    }
}
