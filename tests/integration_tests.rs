//! Integration tests for the buildpipe CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// A buildpipe command isolated in `dir`, with its queue stored there.
fn buildpipe(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("buildpipe");
    cmd.current_dir(dir.path())
        .env("QUEUE_URL", format!("sqlite://{}", dir.path().join("queue.db").display()))
        .env_remove("PIPELINE_BASE_URL")
        .env_remove("PIPELINE_AUTO_DEPLOY")
        .env_remove("RUST_LOG");
    cmd
}

fn enqueue(dir: &TempDir, project_id: &str, prompt: &str) -> i64 {
    let output = buildpipe(dir)
        .args(["enqueue", "--project-id", project_id, "--prompt", prompt])
        .output()
        .unwrap();
    assert!(output.status.success(), "enqueue failed: {:?}", output);
    String::from_utf8(output.stdout).unwrap().trim().parse().unwrap()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help_lists_commands() {
        let dir = TempDir::new().unwrap();
        buildpipe(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("enqueue"))
            .stdout(predicate::str::contains("status"));
    }

    #[test]
    fn test_version() {
        let dir = TempDir::new().unwrap();
        buildpipe(&dir)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("buildpipe"));
    }

    #[test]
    fn test_enqueue_requires_arguments() {
        let dir = TempDir::new().unwrap();
        buildpipe(&dir)
            .args(["enqueue", "--prompt", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--project-id"));
    }
}

mod queue_commands {
    use super::*;

    #[test]
    fn test_enqueue_then_status_is_waiting() {
        let dir = TempDir::new().unwrap();
        let id = enqueue(&dir, "p1", "build a todo app");

        buildpipe(&dir)
            .args(["status", &id.to_string()])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"state\": \"waiting\""))
            .stdout(predicate::str::contains("\"result\": null"));
    }

    #[test]
    fn test_ids_are_distinct() {
        let dir = TempDir::new().unwrap();
        let first = enqueue(&dir, "p1", "one");
        let second = enqueue(&dir, "p1", "two");
        assert_ne!(first, second);
    }

    #[test]
    fn test_enqueue_rejects_blank_prompt() {
        let dir = TempDir::new().unwrap();
        buildpipe(&dir)
            .args(["enqueue", "--project-id", "p1", "--prompt", "  "])
            .assert()
            .failure()
            .stderr(predicate::str::contains("prompt is required"));
    }

    #[test]
    fn test_enqueue_rejects_path_project_id() {
        let dir = TempDir::new().unwrap();
        buildpipe(&dir)
            .args(["enqueue", "--project-id", "/etc", "--prompt", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("projectId '/etc'"));
    }

    #[test]
    fn test_status_unknown_job_fails() {
        let dir = TempDir::new().unwrap();
        buildpipe(&dir)
            .args(["status", "424242"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Queue job 424242 not found"));
    }

    #[test]
    fn test_status_does_not_requeue_active_jobs() {
        let dir = TempDir::new().unwrap();
        let id = enqueue(&dir, "p1", "x");

        // simulate a worker holding the job
        let conn = rusqlite::Connection::open(dir.path().join("queue.db")).unwrap();
        conn.execute("UPDATE queue_jobs SET state = 'active' WHERE id = ?1", [id])
            .unwrap();
        drop(conn);

        buildpipe(&dir)
            .args(["status", &id.to_string()])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"state\": \"active\""));
    }
}

mod configuration {
    use super::*;

    #[test]
    fn test_queue_url_from_config_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("from-config.db");
        fs::create_dir_all(dir.path().join(".buildpipe")).unwrap();
        fs::write(
            dir.path().join(".buildpipe/config.toml"),
            format!("[queue]\nurl = \"sqlite://{}\"\n", db_path.display()),
        )
        .unwrap();

        let mut cmd = cargo_bin_cmd!("buildpipe");
        cmd.current_dir(dir.path())
            .env_remove("QUEUE_URL")
            .args(["enqueue", "--project-id", "p1", "--prompt", "x"])
            .assert()
            .success();
        assert!(db_path.exists());
    }

    #[test]
    fn test_invalid_config_file_fails() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".buildpipe")).unwrap();
        fs::write(dir.path().join(".buildpipe/config.toml"), "[queue\nurl = ").unwrap();

        buildpipe(&dir)
            .args(["status", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse"));
    }

    #[test]
    fn test_project_dir_flag_selects_config() {
        let project = TempDir::new().unwrap();
        let cwd = TempDir::new().unwrap();
        fs::create_dir_all(project.path().join(".buildpipe")).unwrap();
        fs::write(project.path().join(".buildpipe/config.toml"), "not = [valid").unwrap();

        buildpipe(&cwd)
            .arg("--project-dir")
            .arg(project.path())
            .args(["status", "1"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Failed to parse"));
    }
}

mod inline_run {
    use super::*;

    #[test]
    fn test_run_rejects_blank_project_id() {
        let dir = TempDir::new().unwrap();
        buildpipe(&dir)
            .args(["run", "--project-id", "", "--prompt", "x"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("projectId is required"));
    }
}
