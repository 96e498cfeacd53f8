//! Host-side project workspaces: project id checks, directory resolution and
//! tar snapshots used to roll back failed changes.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

static PROJECT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("valid project id regex"));

/// A project id becomes a directory name and part of a `-v host:target`
/// mount, so only a single plain path segment is accepted.
pub fn check_project_id(project_id: &str) -> Result<(), String> {
    if PROJECT_ID_RE.is_match(project_id) {
        Ok(())
    } else {
        Err(format!(
            "projectId '{}' must be 1-128 letters, digits, '.', '_' or '-', starting with a letter or digit",
            project_id
        ))
    }
}

/// Root directory holding one subdirectory per project.
#[derive(Debug, Clone, PartialEq)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Workspace rooted at `dir` made absolute, so mounts never depend on the
    /// engine's working directory.
    pub fn resolve(dir: &Path) -> Self {
        Self::new(std::path::absolute(dir).unwrap_or_else(|_| dir.to_path_buf()))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<project_id>`, for validated ids only.
    pub fn project_dir(&self, project_id: &str) -> Result<PathBuf> {
        check_project_id(project_id).map_err(anyhow::Error::msg)?;
        Ok(self.root.join(project_id))
    }
}

/// Gzipped tarball of a directory's contents, held in memory.
pub struct Snapshot {
    dir: PathBuf,
    archive: Vec<u8>,
}

impl Snapshot {
    /// Capture `dir`, creating it first if needed.
    pub async fn take(dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;

        let output = Command::new("tar")
            .arg("-C")
            .arg(dir)
            .args(["-czf", "-", "."])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run tar")?;
        if !output.status.success() {
            bail!(
                "Snapshot of {} failed: {}",
                dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        debug!(dir = %dir.display(), bytes = output.stdout.len(), "workspace snapshot taken");
        Ok(Self {
            dir: dir.to_path_buf(),
            archive: output.stdout,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn size_bytes(&self) -> usize {
        self.archive.len()
    }

    /// Put the directory back as captured. Entries created since are removed.
    pub async fn restore(&self) -> Result<()> {
        clear_dir(&self.dir).await?;

        let mut child = Command::new("tar")
            .arg("-C")
            .arg(&self.dir)
            .args(["-xzf", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to run tar")?;

        let mut stdin = child.stdin.take().context("tar stdin unavailable")?;
        stdin
            .write_all(&self.archive)
            .await
            .context("Failed to stream snapshot to tar")?;
        drop(stdin);

        let output = child.wait_with_output().await.context("Failed to wait for tar")?;
        if !output.status.success() {
            bail!(
                "Restore of {} failed: {}",
                self.dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        debug!(dir = %self.dir.display(), "workspace snapshot restored");
        Ok(())
    }
}

async fn clear_dir(dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("Failed to read {}", dir.display()))?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let removed = if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        removed.with_context(|| format!("Failed to remove {}", path.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_id_accepts_plain_segments() {
        for id in ["p1", "my-app", "proj_2.v3", "cl9x0abc"] {
            assert!(check_project_id(id).is_ok(), "{id}");
        }
    }

    #[test]
    fn test_project_id_rejects_paths_and_mount_syntax() {
        for id in ["", "/", "/etc", "..", ".", "../../root", "a/b", "a:b", "p1:/etc", ".hidden", "a\\b", " p1"] {
            assert!(check_project_id(id).is_err(), "{id:?}");
        }
        assert!(check_project_id(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_project_dir_stays_under_root() {
        let ws = Workspace::new("/srv/ws");
        assert_eq!(ws.project_dir("p1").unwrap(), PathBuf::from("/srv/ws/p1"));
        assert!(ws.project_dir("/etc").is_err());
        assert!(ws.project_dir("../../root").is_err());
    }

    #[test]
    fn test_resolve_makes_root_absolute() {
        let ws = Workspace::resolve(Path::new(".buildpipe/workspace"));
        assert!(ws.root().is_absolute());
        assert!(ws.root().ends_with(".buildpipe/workspace"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restore_reverts_edits_and_removes_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("p1");
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(project.join("src/app.ts"), "original").unwrap();

        let snapshot = Snapshot::take(&project).await.unwrap();
        assert!(snapshot.size_bytes() > 0);

        std::fs::write(project.join("src/app.ts"), "broken").unwrap();
        std::fs::write(project.join("stray.txt"), "x").unwrap();
        std::fs::create_dir_all(project.join("node_modules/pkg")).unwrap();

        snapshot.restore().await.unwrap();

        assert_eq!(std::fs::read_to_string(project.join("src/app.ts")).unwrap(), "original");
        assert!(!project.join("stray.txt").exists());
        assert!(!project.join("node_modules").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_snapshot_creates_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("fresh");
        let snapshot = Snapshot::take(&project).await.unwrap();
        assert!(project.is_dir());
        std::fs::write(project.join("new.txt"), "x").unwrap();
        snapshot.restore().await.unwrap();
        assert_eq!(std::fs::read_dir(&project).unwrap().count(), 0);
    }
}
