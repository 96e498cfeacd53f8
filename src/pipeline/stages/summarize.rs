use chrono::Utc;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::warn;

use super::StageEnv;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::models::{ExecutionResult, FixResult, OverallStatus, Summary, TestResult};
use crate::util::parse_json_response;

const SUMMARY_SYSTEM_PROMPT: &str = r#"You are a project manager. Create a summary of the development pipeline execution.

You MUST respond with valid JSON only (no markdown, no explanation) matching this schema:
{
  "overall_status": "success" | "partial_success" | "failed",
  "summary": "Brief overview of what was accomplished",
  "key_achievements": ["..."],
  "issues_encountered": ["..."],
  "fixes_applied": ["..."],
  "recommendations": ["..."],
  "metrics": {"any": "execution statistics"},
  "deployment_status": "Current deployment state"
}
"#;

/// Outcomes of the earlier stages that the summary reports on.
pub struct RunOutcome<'a> {
    pub execution: &'a ExecutionResult,
    pub test: &'a TestResult,
    pub fix: Option<&'a FixResult>,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    overall_status: OverallStatus,
    #[serde(default)]
    summary: Option<String>,
    #[serde(default)]
    key_achievements: Vec<String>,
    #[serde(default)]
    issues_encountered: Vec<String>,
    #[serde(default)]
    fixes_applied: Vec<String>,
    #[serde(default)]
    recommendations: Vec<String>,
    #[serde(default)]
    metrics: Map<String, Value>,
    #[serde(default)]
    deployment_status: Option<String>,
}

/// Ask the generator for a structured summary; synthesize one from local
/// counters when it fails or returns an unrecognised status.
pub async fn summarize(ctx: &mut PipelineContext, env: &StageEnv, outcome: RunOutcome<'_>) -> Summary {
    ctx.log("summarize:generating");

    let fix_line = match outcome.fix {
        Some(fix) => format!(
            "- Fixed: {}\n- Fixes attempted: {}\n- Fix summary: {}",
            fix.fixed,
            fix.fixes.len(),
            fix.summary
        ),
        None => "- Fix stage not run".to_string(),
    };
    let prompt = format!(
        "Original prompt: {}\n\nExecution: {}/{} steps succeeded\nTests passed: {} (coverage {:.0}%)\n\nFix results:\n{}\n\nExecution logs:\n{}\n\nRespond with JSON only.",
        ctx.prompt,
        outcome.execution.success_count,
        outcome.execution.total_steps,
        outcome.test.passed,
        outcome.test.coverage,
        fix_line,
        ctx.logs().join("\n"),
    );

    let parsed = match env.generator.generate(SUMMARY_SYSTEM_PROMPT, &prompt).await {
        Ok(text) => parse_json_response::<SummaryResponse>(&text),
        Err(e) => Err(e),
    };

    match parsed {
        Ok(response) => {
            ctx.log("summarize:done");
            Summary {
                overall_status: response.overall_status,
                summary: response
                    .summary
                    .unwrap_or_else(|| "Pipeline execution completed".to_string()),
                key_achievements: response.key_achievements,
                issues_encountered: response.issues_encountered,
                fixes_applied: response.fixes_applied,
                recommendations: response.recommendations,
                metrics: response.metrics,
                deployment_status: response.deployment_status.unwrap_or_else(|| "unknown".to_string()),
                synthesized: false,
                timestamp: Utc::now(),
            }
        }
        Err(e) => {
            warn!(project_id = %ctx.project_id, error = %e, "summary generation failed, synthesizing");
            ctx.log("summarize:synthesized");
            fallback_summary(ctx, &outcome, &format!("{:#}", e))
        }
    }
}

/// Derive a status from the stage outcomes: tests passing is success, any
/// successful step or applied fix is partial success, otherwise failed.
pub fn derive_status(outcome: &RunOutcome<'_>) -> OverallStatus {
    let fixes_applied = outcome.fix.map(FixResult::applied_count).unwrap_or(0);
    if outcome.test.passed {
        OverallStatus::Success
    } else if outcome.execution.ok || fixes_applied > 0 {
        OverallStatus::PartialSuccess
    } else {
        OverallStatus::Failed
    }
}

fn fallback_summary(ctx: &PipelineContext, outcome: &RunOutcome<'_>, error: &str) -> Summary {
    let fixes = outcome.fix.map(|f| f.fixes.as_slice()).unwrap_or_default();
    let applied: Vec<String> = fixes
        .iter()
        .filter(|f| f.applied)
        .map(|f| f.description.clone())
        .collect();

    let mut issues = vec![format!("Summary generation failed: {}", error)];
    if let Some(e) = &outcome.test.error {
        issues.push(e.clone());
    }
    issues.extend(outcome.test.failed_suites().map(|s| format!("{} failed", s.name)));

    let metrics = json!({
        "total_logs": ctx.logs().len(),
        "steps_succeeded": outcome.execution.success_count,
        "steps_total": outcome.execution.total_steps,
        "suites_passed": outcome.test.summary.passed,
        "suites_total": outcome.test.summary.total,
        "coverage": outcome.test.coverage,
        "fixes_attempted": fixes.len(),
        "fixes_successful": applied.len(),
    });

    Summary {
        overall_status: derive_status(outcome),
        summary: "Pipeline execution completed; summary synthesized from stage results".to_string(),
        key_achievements: vec![format!(
            "{}/{} steps executed successfully",
            outcome.execution.success_count, outcome.execution.total_steps
        )],
        issues_encountered: issues,
        fixes_applied: applied,
        recommendations: vec![
            "Review execution logs for details".to_string(),
            "Consider manual intervention".to_string(),
        ],
        metrics: match metrics {
            Value::Object(map) => map,
            _ => Map::new(),
        },
        deployment_status: "unknown".to_string(),
        synthesized: true,
        timestamp: Utc::now(),
    }
}
