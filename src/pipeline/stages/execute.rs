use tracing::{info, warn};

use super::StageEnv;
use crate::pipeline::context::PipelineContext;
use crate::pipeline::models::{ExecutionResult, FileChange, PlanResult, PlanStep, StepKind, StepOutcome, shell_quote};

/// Run every step in ascending `order` (ties keep plan order). Failures are
/// recorded per step; later steps still run. `ok` iff at least one step
/// succeeded. Stops launching steps once the run is cancelled.
pub async fn execute(ctx: &mut PipelineContext, env: &StageEnv, plan: &PlanResult) -> ExecutionResult {
    ctx.log(format!("execute:steps:{}", plan.steps.len()));

    let mut steps: Vec<&PlanStep> = plan.steps.iter().collect();
    steps.sort_by_key(|s| s.order);

    let mut outcomes = Vec::with_capacity(steps.len());
    for step in steps {
        if ctx.is_cancelled() {
            ctx.log("execute:cancelled");
            break;
        }
        ctx.log(format!("exec:{}:{}", step.kind.as_str(), step.name));
        let outcome = run_step(&ctx.project_id, env, step).await;
        if outcome.success {
            ctx.log(format!("exec:ok:{}", step.id));
        } else {
            warn!(project_id = %ctx.project_id, step = %step.id, error = ?outcome.error, "step failed");
            ctx.log(format!("exec:failed:{}", step.id));
        }
        outcomes.push(outcome);
    }

    let result = ExecutionResult::from_outcomes(outcomes);
    info!(
        project_id = %ctx.project_id,
        succeeded = result.success_count,
        total = result.total_steps,
        "execution finished"
    );
    ctx.log(format!("execute:done:{}/{}", result.success_count, result.total_steps));
    result
}

async fn run_step(project_id: &str, env: &StageEnv, step: &PlanStep) -> StepOutcome {
    let result = match &step.kind {
        StepKind::File { files } => write_files(project_id, env, files).await,
        StepKind::Dependency { packages } => {
            if packages.is_empty() {
                Ok("No packages to install".to_string())
            } else {
                let quoted: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
                let command = format!("{} install {}", env.settings.package_manager, quoted.join(" "));
                run_commands(project_id, env, std::slice::from_ref(&command)).await
            }
        }
        StepKind::Command { commands } | StepKind::Test { commands } | StepKind::Deploy { commands } => {
            run_commands(project_id, env, commands).await
        }
    };

    match result {
        Ok(output) => StepOutcome {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            success: true,
            output,
            error: None,
        },
        Err((output, error)) => StepOutcome {
            step_id: step.id.clone(),
            step_name: step.name.clone(),
            success: false,
            output,
            error: Some(error),
        },
    }
}

async fn write_files(project_id: &str, env: &StageEnv, files: &[FileChange]) -> Result<String, (String, String)> {
    let mut written = Vec::with_capacity(files.len());
    for file in files {
        if let Err(e) = env.files.write_file(project_id, &file.path, &file.content).await {
            return Err((written.join("\n"), format!("{:#}", e)));
        }
        written.push(format!("wrote {}", file.path));
    }
    Ok(written.join("\n"))
}

/// Run commands in order, stopping at the first failure.
pub(super) async fn run_commands(
    project_id: &str,
    env: &StageEnv,
    commands: &[String],
) -> Result<String, (String, String)> {
    let mut output = Vec::with_capacity(commands.len());
    for command in commands {
        let outcome = env.run_command(project_id, command).await;
        output.push(outcome.output.clone());
        if !outcome.succeeded() {
            let error = if outcome.timed_out {
                format!("Command timed out: {}", command)
            } else {
                match outcome.exit_code {
                    Some(code) => format!("Command exited with code {}: {}", code, command),
                    None => format!("Command did not complete ({}): {}", outcome.status, command),
                }
            };
            return Err((output.join("\n"), error));
        }
    }
    Ok(output.join("\n"))
}
