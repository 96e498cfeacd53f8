use tracing::warn;

use super::StageEnv;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::models::AnalysisResult;
use crate::util::{parse_json_response, truncate_chars};

const ANALYZE_SYSTEM_PROMPT: &str = r#"You are a senior software architect. Analyze the user's request for a web application.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "objectives": ["High-level goals the build must achieve"],
  "requirements": ["Concrete functional requirements"],
  "constraints": ["Limitations or non-functional constraints"],
  "technologies": ["Frameworks and libraries to use"]
}
"#;

/// Break the prompt into objectives. Never fails: any generation or parse
/// error degrades to the raw prompt as the only objective.
pub async fn analyze(ctx: &mut PipelineContext, env: &StageEnv) -> AnalysisResult {
    ctx.log(format!("analyze:prompt:{}", truncate_chars(&ctx.prompt, 100)));

    let prompt = format!(
        "Project: {}\n\nRequest:\n{}\n\nRespond with JSON only.",
        ctx.project_id, ctx.prompt
    );

    let parsed = match env.generator.generate(ANALYZE_SYSTEM_PROMPT, &prompt).await {
        Ok(text) => parse_json_response::<AnalysisResult>(&text),
        Err(e) => Err(e),
    };

    let analysis = match parsed {
        Ok(mut analysis) if !analysis.objectives.is_empty() => {
            analysis.error = None;
            analysis
        }
        Ok(_) => AnalysisResult::fallback(&ctx.prompt, "Analysis returned no objectives"),
        Err(e) => {
            warn!(project_id = %ctx.project_id, error = %e, "analysis failed, using prompt as objective");
            AnalysisResult::fallback(&ctx.prompt, format!("{:#}", e))
        }
    };

    ctx.log(format!("analyze:objectives:{}", analysis.objectives.len()));
    analysis
}
