use tracing::warn;

use super::StageEnv;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::models::{AnalysisResult, PlanResult};
use crate::util::parse_json_response;

const PLAN_SYSTEM_PROMPT: &str = r#"You are a build planner. Turn the analysis into an ordered list of executable steps.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "steps": [
    {
      "id": "step-1",
      "name": "Short step name",
      "order": 0,
      "type": "file" | "command" | "dependency" | "test" | "deploy",
      "files": [{"path": "relative/path.ts", "content": "full file content"}],
      "commands": ["shell command"],
      "packages": ["package-name"]
    }
  ]
}

Rules:
- "file" steps use "files"; "dependency" steps use "packages"; "command", "test" and "deploy" steps use "commands".
- Steps run in ascending "order".
- Paths are relative to the project root.
"#;

/// Produce typed steps, stable-sorted by `order`. Falls back to one
/// `echo <objective>` command step per objective.
pub async fn plan(ctx: &mut PipelineContext, env: &StageEnv, analysis: &AnalysisResult) -> PlanResult {
    ctx.log(format!("plan:objectives:{}", analysis.objectives.len()));

    let analysis_json = serde_json::to_string_pretty(analysis).unwrap_or_default();
    let prompt = format!(
        "Project: {}\n\nOriginal request:\n{}\n\nAnalysis:\n{}\n\nRespond with JSON only.",
        ctx.project_id, ctx.prompt, analysis_json
    );

    let parsed = match env.generator.generate(PLAN_SYSTEM_PROMPT, &prompt).await {
        Ok(text) => parse_json_response::<PlanResult>(&text),
        Err(e) => Err(e),
    };

    let result = match parsed {
        Ok(plan) if !plan.steps.is_empty() => PlanResult { error: None, ..plan }.sorted(),
        Ok(_) => PlanResult::fallback(analysis, "Plan contained no steps"),
        Err(e) => {
            warn!(project_id = %ctx.project_id, error = %e, "planning failed, using fallback plan");
            PlanResult::fallback(analysis, format!("{:#}", e))
        }
    };

    ctx.log(format!("plan:steps:{}", result.steps.len()));
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_util::sync::CancellationToken;

    use super::super::testing::*;
    use super::*;
    use crate::pipeline::context::PipelinePayload;
    use crate::pipeline::models::StepKind;

    fn env_with(generator: ScriptedGenerator) -> StageEnv {
        env(
            Arc::new(generator),
            Arc::new(RecordingFileWriter::default()),
            Arc::new(FakeSandbox::always_ok()),
        )
    }

    fn analysis(objectives: &[&str]) -> AnalysisResult {
        AnalysisResult {
            objectives: objectives.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_plan_sorts_generated_steps() {
        let env = env_with(ScriptedGenerator::new([r#"{"steps": [
            {"id": "b", "name": "Build", "order": 3, "type": "command", "commands": ["npm run build"]},
            {"id": "w", "name": "Write", "order": 1, "type": "file", "files": [{"path": "a.ts", "content": ""}]},
            {"id": "i", "name": "Install", "order": 1, "type": "dependency", "packages": ["zod"]}
        ]}"#]));
        let mut ctx = PipelineContext::new(&PipelinePayload::new("p", "x"), CancellationToken::new());
        let plan = plan(&mut ctx, &env, &analysis(&["x"])).await;

        let ids: Vec<&str> = plan.steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["w", "i", "b"]);
        assert!(plan.error.is_none());
        assert_eq!(ctx.logs(), ["plan:objectives:1", "plan:steps:3"]);
    }

    #[tokio::test]
    async fn test_plan_fallback_on_failure() {
        let env = env_with(ScriptedGenerator::failing());
        let mut ctx = PipelineContext::new(&PipelinePayload::new("p", "x"), CancellationToken::new());
        let plan = plan(&mut ctx, &env, &analysis(&["build a todo app", "add login"])).await;

        assert_eq!(plan.steps.len(), 2);
        assert!(plan.error.is_some());
        for step in &plan.steps {
            assert!(matches!(&step.kind, StepKind::Command { commands } if commands[0].starts_with("echo ")));
        }
    }

    #[tokio::test]
    async fn test_plan_fallback_on_unknown_step_type() {
        let env = env_with(ScriptedGenerator::new([
            r#"{"steps": [{"id": "x", "name": "x", "type": "launch_rocket"}]}"#,
        ]));
        let mut ctx = PipelineContext::new(&PipelinePayload::new("p", "x"), CancellationToken::new());
        let plan = plan(&mut ctx, &env, &analysis(&["ship it"])).await;
        assert_eq!(plan.steps.len(), 1);
        assert_eq!(plan.steps[0].kind.as_str(), "command");
    }
}
