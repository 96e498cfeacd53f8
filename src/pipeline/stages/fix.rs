use serde::Deserialize;
use tracing::{info, warn};

use super::StageEnv;
use super::execute::run_commands;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::models::{FileChange, Fix, FixResult, FixType, SuiteResult, TestResult};
use crate::util::{parse_json_response, truncate_chars};
use crate::workspace::Snapshot;

const FIX_SYSTEM_PROMPT: &str = r#"You are a debugging expert. Analyze the test failure and provide a specific fix.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "description": "What the issue is",
  "type": "code_fix" | "dependency_fix" | "config_fix" | "test_fix",
  "files": [{"path": "relative/path.ts", "content": "full new file content"}],
  "commands": ["shell commands to run"],
  "explanation": "Why this fix should work"
}

Be specific and actionable. Focus on the root cause of the failure.
"#;

/// Largest slice of suite output forwarded to the generator.
const MAX_OUTPUT_CHARS: usize = 4000;

#[derive(Debug, Deserialize)]
struct FixProposal {
    #[serde(default)]
    description: Option<String>,
    #[serde(default, rename = "type")]
    fix_type: Option<String>,
    #[serde(default)]
    files: Vec<FileChange>,
    #[serde(default)]
    commands: Vec<String>,
    #[serde(default)]
    explanation: Option<String>,
}

impl FixProposal {
    fn into_fix(self, test_name: &str) -> Fix {
        Fix {
            test_name: test_name.to_string(),
            description: self.description.unwrap_or_else(|| "Unknown issue".to_string()),
            fix_type: self
                .fix_type
                .and_then(|t| t.parse::<FixType>().ok())
                .unwrap_or_default(),
            files: self.files,
            commands: self.commands,
            explanation: self.explanation.unwrap_or_default(),
            applied: false,
            rolled_back: false,
        }
    }
}

/// Generate and apply one remediation per failed suite.
///
/// A fix is applied all-or-nothing: every file write and every command must
/// succeed for `applied` to be set. With a local workspace the project
/// directory is snapshotted first and restored when the apply fails. Suites
/// whose fix cannot be generated are logged and skipped.
pub async fn fix(ctx: &mut PipelineContext, env: &StageEnv, test: &TestResult) -> FixResult {
    if test.passed {
        ctx.log("fix:not_needed");
        return FixResult {
            fixed: true,
            fixes: vec![],
            summary: "No issues found".to_string(),
        };
    }

    let mut fixes = Vec::new();
    for suite in test.failed_suites() {
        if ctx.is_cancelled() {
            ctx.log("fix:cancelled");
            break;
        }
        ctx.log(format!("fix:analyze:{}", suite.kind));

        let mut fix = match generate_fix(ctx, env, suite).await {
            Ok(fix) => fix,
            Err(e) => {
                warn!(project_id = %ctx.project_id, suite = %suite.kind, error = %e, "could not generate fix");
                ctx.log(format!("fix:generate_failed:{}", suite.kind));
                continue;
            }
        };

        match apply_fix(&ctx.project_id, env, &fix).await {
            Ok(()) => {
                fix.applied = true;
                ctx.log(format!("fix:applied:{}", suite.kind));
            }
            Err(failure) => {
                warn!(project_id = %ctx.project_id, suite = %suite.kind, error = %failure.error, "fix not applied");
                ctx.log(format!("fix:apply_failed:{}", suite.kind));
                if failure.rolled_back {
                    fix.rolled_back = true;
                    ctx.log(format!("fix:rolled_back:{}", suite.kind));
                }
            }
        }
        fixes.push(fix);
    }

    let applied = fixes.iter().filter(|f| f.applied).count();
    info!(project_id = %ctx.project_id, applied, attempted = fixes.len(), "fix stage finished");
    ctx.log(format!("fix:done:{}/{}", applied, fixes.len()));

    FixResult {
        fixed: applied > 0,
        summary: format!("Applied {} fixes out of {} attempted", applied, fixes.len()),
        fixes,
    }
}

async fn generate_fix(ctx: &PipelineContext, env: &StageEnv, suite: &SuiteResult) -> anyhow::Result<Fix> {
    let prompt = format!(
        "Project: {}\nTest: {}\nType: {}\nOutput:\n{}\nError: {}\n\nPlease provide a fix for this test failure. Respond with JSON only.",
        ctx.project_id,
        suite.name,
        suite.kind,
        truncate_chars(&suite.output, MAX_OUTPUT_CHARS),
        suite.error.as_deref().unwrap_or("None"),
    );
    let text = env.generator.generate(FIX_SYSTEM_PROMPT, &prompt).await?;
    let proposal: FixProposal = parse_json_response(&text)?;
    Ok(proposal.into_fix(&suite.name))
}

struct ApplyFailure {
    error: anyhow::Error,
    rolled_back: bool,
}

impl From<anyhow::Error> for ApplyFailure {
    fn from(error: anyhow::Error) -> Self {
        Self {
            error,
            rolled_back: false,
        }
    }
}

async fn apply_fix(project_id: &str, env: &StageEnv, fix: &Fix) -> Result<(), ApplyFailure> {
    let snapshot = match &env.settings.host_workspace {
        Some(workspace) => Some(Snapshot::take(&workspace.project_dir(project_id)?).await?),
        None => None,
    };

    let Err(error) = write_and_run(project_id, env, fix).await else {
        return Ok(());
    };
    let Some(snapshot) = snapshot else {
        return Err(error.into());
    };
    match snapshot.restore().await {
        Ok(()) => Err(ApplyFailure {
            error,
            rolled_back: true,
        }),
        Err(restore_err) => {
            warn!(project_id, error = %restore_err, "could not roll back partial fix");
            Err(error.context(format!("rollback failed: {:#}", restore_err)).into())
        }
    }
}

async fn write_and_run(project_id: &str, env: &StageEnv, fix: &Fix) -> anyhow::Result<()> {
    for file in &fix.files {
        env.files.write_file(project_id, &file.path, &file.content).await?;
    }
    run_commands(project_id, env, &fix.commands)
        .await
        .map_err(|(_, error)| anyhow::anyhow!(error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::super::testing::*;
    use super::*;
    use crate::pipeline::context::PipelinePayload;
    use crate::pipeline::models::SuiteKind;

    fn ctx() -> PipelineContext {
        PipelineContext::new(&PipelinePayload::new("p1", "x"), CancellationToken::new())
    }

    fn suite(kind: SuiteKind, passed: bool) -> SuiteResult {
        SuiteResult {
            name: kind.display_name().into(),
            kind,
            passed,
            output: "FAIL src/app.test.ts".into(),
            duration_ms: 10,
            error: (!passed).then(|| "failed".to_string()),
        }
    }

    fn failing_tests() -> TestResult {
        TestResult::from_suites(vec![
            suite(SuiteKind::Unit, false),
            suite(SuiteKind::Integration, true),
            suite(SuiteKind::Lint, false),
            suite(SuiteKind::TypeCheck, true),
        ])
    }

    #[tokio::test]
    async fn test_passed_tests_need_no_fix() {
        let generator = Arc::new(ScriptedGenerator::failing());
        let env = env(
            generator.clone(),
            Arc::new(RecordingFileWriter::default()),
            Arc::new(FakeSandbox::always_ok()),
        );
        let passing = TestResult::from_suites(vec![suite(SuiteKind::Unit, true)]);
        let result = fix(&mut ctx(), &env, &passing).await;
        assert!(result.fixed);
        assert!(result.fixes.is_empty());
        assert_eq!(generator.call_count(), 0);
    }

    #[tokio::test]
    async fn test_one_fix_per_failed_suite_applied() {
        let generator = Arc::new(ScriptedGenerator::new([
            r#"{"description": "missing export", "type": "code_fix",
                "files": [{"path": "src/app.ts", "content": "export const app = 1;"}],
                "commands": [], "explanation": "export it"}"#,
            r#"{"description": "lint config", "type": "config_fix",
                "commands": ["npx eslint --fix ."]}"#,
        ]));
        let files = Arc::new(RecordingFileWriter::default());
        let sandbox = Arc::new(FakeSandbox::always_ok());
        let env = env(generator.clone(), files.clone(), sandbox.clone());

        let result = fix(&mut ctx(), &env, &failing_tests()).await;

        assert_eq!(generator.call_count(), 2);
        assert_eq!(result.fixes.len(), 2);
        assert!(result.fixed);
        assert!(result.fixes.iter().all(|f| f.applied));
        assert_eq!(result.fixes[0].test_name, "Unit Tests");
        assert_eq!(result.fixes[1].fix_type, FixType::ConfigFix);
        assert_eq!(files.writes.lock().unwrap().len(), 1);
        assert_eq!(sandbox.scripts(), vec!["npx eslint --fix ."]);
        assert_eq!(result.summary, "Applied 2 fixes out of 2 attempted");
    }

    #[tokio::test]
    async fn test_fix_is_all_or_nothing() {
        let generator = Arc::new(ScriptedGenerator::new([r#"{"description": "d",
            "files": [{"path": "ok.ts", "content": ""}, {"path": "locked.ts", "content": ""}],
            "commands": ["npm install"]}"#]));
        let files = Arc::new(RecordingFileWriter::failing_on(&["locked.ts"]));
        let sandbox = Arc::new(FakeSandbox::always_ok());
        let env = env(generator, files, sandbox.clone());
        let tests = TestResult::from_suites(vec![suite(SuiteKind::Unit, false)]);

        let result = fix(&mut ctx(), &env, &tests).await;
        assert_eq!(result.fixes.len(), 1);
        assert!(!result.fixes[0].applied);
        assert!(!result.fixed);
        assert!(sandbox.scripts().is_empty());
    }

    #[tokio::test]
    async fn test_failing_command_leaves_fix_unapplied() {
        let generator = Arc::new(ScriptedGenerator::new([r#"{"commands": ["npm ci", "npm run build"]}"#]));
        let sandbox = Arc::new(FakeSandbox::new(|s| if s == "npm ci" { (0, String::new()) } else { (1, String::new()) }));
        let env = env(generator, Arc::new(RecordingFileWriter::default()), sandbox);
        let tests = TestResult::from_suites(vec![suite(SuiteKind::Unit, false)]);

        let result = fix(&mut ctx(), &env, &tests).await;
        assert!(!result.fixes[0].applied);
        assert_eq!(result.fixes[0].description, "Unknown issue");
        assert_eq!(result.fixes[0].fix_type, FixType::CodeFix);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_fix_restores_local_workspace() {
        use crate::pipeline::LocalFileWriter;
        use crate::workspace::Workspace;

        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let project = workspace.project_dir("p1").unwrap();
        std::fs::create_dir_all(project.join("src")).unwrap();
        std::fs::write(project.join("src/app.ts"), "original").unwrap();

        let generator = Arc::new(ScriptedGenerator::new([r#"{"description": "rewrite app",
            "files": [{"path": "src/app.ts", "content": "rewritten"}, {"path": "src/new.ts", "content": "x"}],
            "commands": ["npm run build"]}"#]));
        let sandbox = Arc::new(FakeSandbox::new(|_| (1, "build failed".into())));
        let mut env = env(generator, Arc::new(LocalFileWriter::new(workspace.clone())), sandbox);
        env.settings.host_workspace = Some(workspace);
        let tests = TestResult::from_suites(vec![suite(SuiteKind::Unit, false)]);

        let mut ctx = ctx();
        let result = fix(&mut ctx, &env, &tests).await;

        assert!(!result.fixes[0].applied);
        assert!(result.fixes[0].rolled_back);
        assert_eq!(std::fs::read_to_string(project.join("src/app.ts")).unwrap(), "original");
        assert!(!project.join("src/new.ts").exists());
        assert!(ctx.logs().iter().any(|l| l == "fix:rolled_back:unit"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_fix_keeps_changes() {
        use crate::pipeline::LocalFileWriter;
        use crate::workspace::Workspace;

        let dir = tempfile::tempdir().unwrap();
        let workspace = Workspace::new(dir.path());
        let generator = Arc::new(ScriptedGenerator::new([
            r#"{"files": [{"path": "src/app.ts", "content": "fixed"}], "commands": ["npm test"]}"#,
        ]));
        let mut env = env(
            generator,
            Arc::new(LocalFileWriter::new(workspace.clone())),
            Arc::new(FakeSandbox::always_ok()),
        );
        env.settings.host_workspace = Some(workspace.clone());
        let tests = TestResult::from_suites(vec![suite(SuiteKind::Unit, false)]);

        let result = fix(&mut ctx(), &env, &tests).await;

        assert!(result.fixes[0].applied);
        assert!(!result.fixes[0].rolled_back);
        let app = workspace.project_dir("p1").unwrap().join("src/app.ts");
        assert_eq!(std::fs::read_to_string(app).unwrap(), "fixed");
    }

    #[tokio::test]
    async fn test_cancel_stops_remaining_fixes() {
        let token = CancellationToken::new();
        let generator = Arc::new(ScriptedGenerator::new([
            r#"{"commands": ["npm ci"]}"#,
            r#"{"commands": ["npx eslint --fix ."]}"#,
        ]));
        let sandbox = Arc::new(FakeSandbox::new({
            let token = token.clone();
            move |_| {
                token.cancel();
                (0, String::new())
            }
        }));
        let env = env(generator.clone(), Arc::new(RecordingFileWriter::default()), sandbox.clone());
        let mut ctx = PipelineContext::new(&PipelinePayload::new("p1", "x"), token);

        let result = fix(&mut ctx, &env, &failing_tests()).await;

        assert_eq!(result.fixes.len(), 1);
        assert_eq!(generator.call_count(), 1);
        assert_eq!(sandbox.scripts(), vec!["npm ci"]);
        assert!(ctx.logs().iter().any(|l| l == "fix:cancelled"));
    }

    #[tokio::test]
    async fn test_generation_failure_skips_suite() {
        let env = env(
            Arc::new(ScriptedGenerator::new(["not json"])),
            Arc::new(RecordingFileWriter::default()),
            Arc::new(FakeSandbox::always_ok()),
        );
        let mut ctx = ctx();
        let result = fix(&mut ctx, &env, &failing_tests()).await;
        assert!(result.fixes.is_empty());
        assert!(!result.fixed);
        assert!(ctx.logs().iter().any(|l| l == "fix:generate_failed:unit"));
    }
}
