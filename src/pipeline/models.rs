use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── analyze ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub technologies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AnalysisResult {
    /// The raw prompt as the sole objective.
    pub fn fallback(prompt: &str, error: impl Into<String>) -> Self {
        Self {
            objectives: vec![prompt.to_string()],
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

// ── plan ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    #[serde(default)]
    pub content: String,
}

/// Closed set of plan step kinds, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    File {
        #[serde(default)]
        files: Vec<FileChange>,
    },
    Command {
        #[serde(default)]
        commands: Vec<String>,
    },
    Dependency {
        #[serde(default)]
        packages: Vec<String>,
    },
    Test {
        #[serde(default)]
        commands: Vec<String>,
    },
    Deploy {
        #[serde(default)]
        commands: Vec<String>,
    },
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File { .. } => "file",
            Self::Command { .. } => "command",
            Self::Dependency { .. } => "dependency",
            Self::Test { .. } => "test",
            Self::Deploy { .. } => "deploy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub order: i64,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    #[serde(default)]
    pub steps: Vec<PlanStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanResult {
    /// Sort steps by `order`; ties keep their insertion order.
    pub fn sorted(mut self) -> Self {
        self.steps.sort_by_key(|s| s.order);
        self
    }

    /// One `echo <objective>` command step per objective.
    pub fn fallback(analysis: &AnalysisResult, error: impl Into<String>) -> Self {
        let steps = analysis
            .objectives
            .iter()
            .enumerate()
            .map(|(i, objective)| PlanStep {
                id: format!("step-{}", i + 1),
                name: format!("Objective {}", i + 1),
                order: i as i64,
                kind: StepKind::Command {
                    commands: vec![format!("echo {}", shell_quote(objective))],
                },
            })
            .collect();
        Self {
            steps,
            error: Some(error.into()),
        }
    }
}

/// Single-quote `s` for `sh -c`.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ── execute ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOutcome {
    pub step_id: String,
    pub step_name: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub ok: bool,
    pub results: Vec<StepOutcome>,
    pub success_count: usize,
    pub total_steps: usize,
}

impl ExecutionResult {
    pub fn from_outcomes(results: Vec<StepOutcome>) -> Self {
        let success_count = results.iter().filter(|r| r.success).count();
        Self {
            ok: success_count > 0,
            total_steps: results.len(),
            success_count,
            results,
        }
    }
}

// ── test ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuiteKind {
    Unit,
    Integration,
    Lint,
    TypeCheck,
}

impl SuiteKind {
    pub const ALL: [SuiteKind; 4] = [Self::Unit, Self::Integration, Self::Lint, Self::TypeCheck];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unit => "unit",
            Self::Integration => "integration",
            Self::Lint => "lint",
            Self::TypeCheck => "type_check",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Unit => "Unit Tests",
            Self::Integration => "Integration Tests",
            Self::Lint => "Linting",
            Self::TypeCheck => "Type Checking",
        }
    }

    /// Output marker meaning "tool not configured", which counts as a pass.
    /// Unit tests have none: they must actually succeed.
    pub fn absent_sentinel(&self) -> Option<&'static str> {
        match self {
            Self::Unit => None,
            Self::Integration => Some("No integration tests"),
            Self::Lint => Some("No linting"),
            Self::TypeCheck => Some("No TypeScript"),
        }
    }
}

impl std::fmt::Display for SuiteKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuiteResult {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: SuiteKind,
    pub passed: bool,
    pub output: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub passed: bool,
    pub suites: Vec<SuiteResult>,
    pub coverage: f64,
    pub summary: TestSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TestResult {
    pub fn skipped(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn from_suites(suites: Vec<SuiteResult>) -> Self {
        let total = suites.len();
        let passed = suites.iter().filter(|s| s.passed).count();
        Self {
            passed: total > 0 && passed == total,
            coverage: coverage(passed, total),
            summary: TestSummary {
                total,
                passed,
                failed: total - passed,
                duration_ms: suites.iter().map(|s| s.duration_ms).sum(),
            },
            suites,
            error: None,
        }
    }

    pub fn failed_suites(&self) -> impl Iterator<Item = &SuiteResult> {
        self.suites.iter().filter(|s| !s.passed)
    }
}

/// Passed suites as a percentage of all suites.
pub fn coverage(passed: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        passed as f64 / total as f64 * 100.0
    }
}

// ── fix ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FixType {
    #[default]
    CodeFix,
    DependencyFix,
    ConfigFix,
    TestFix,
}

impl FixType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeFix => "code_fix",
            Self::DependencyFix => "dependency_fix",
            Self::ConfigFix => "config_fix",
            Self::TestFix => "test_fix",
        }
    }
}

impl FromStr for FixType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "code_fix" => Ok(Self::CodeFix),
            "dependency_fix" => Ok(Self::DependencyFix),
            "config_fix" => Ok(Self::ConfigFix),
            "test_fix" => Ok(Self::TestFix),
            _ => Err(format!("Invalid fix type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fix {
    pub test_name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub fix_type: FixType,
    pub files: Vec<FileChange>,
    pub commands: Vec<String>,
    pub explanation: String,
    pub applied: bool,
    /// The workspace was restored after a partial apply.
    #[serde(default)]
    pub rolled_back: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FixResult {
    pub fixed: bool,
    pub fixes: Vec<Fix>,
    pub summary: String,
}

impl FixResult {
    pub fn applied_count(&self) -> usize {
        self.fixes.iter().filter(|f| f.applied).count()
    }
}

// ── summarize ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Success,
    PartialSuccess,
    Failed,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub overall_status: OverallStatus,
    pub summary: String,
    pub key_achievements: Vec<String>,
    pub issues_encountered: Vec<String>,
    pub fixes_applied: Vec<String>,
    pub recommendations: Vec<String>,
    pub metrics: serde_json::Map<String, serde_json::Value>,
    pub deployment_status: String,
    /// True when synthesized locally because the generator failed.
    pub synthesized: bool,
    pub timestamp: DateTime<Utc>,
}

// ── report ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeploymentOutcome {
    pub triggered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final record of one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineReport {
    pub project_id: String,
    pub overall_status: OverallStatus,
    pub analysis: AnalysisResult,
    pub plan: PlanResult,
    pub execution: ExecutionResult,
    pub test: TestResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<FixResult>,
    pub summary: Summary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<DeploymentOutcome>,
    pub logs: Vec<String>,
}
