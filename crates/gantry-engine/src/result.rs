//! Stage, instance and run result types, serialized into `results.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use gantry_types::coverage::CoverageSummary;
use gantry_types::state::{RunId, RunStatus};
use serde::{Deserialize, Serialize};

/// Terminal state of one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Succeeded,
    Failed,
    /// Not started because an upstream stage failed fatally.
    Skipped,
    /// Not started, or torn down, because the run was cancelled.
    Cancelled,
}

/// Outcome of one suite across all its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuiteResult {
    pub name: String,
    pub passed: bool,
    pub attempts: u32,
    pub failures: u32,
    /// Per-invocation coverage artifact files, if kept.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<PathBuf>,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub name: String,
    pub kind: String,
    pub state: StageState,
    pub best_effort: bool,
    pub duration_secs: f64,
    /// Attempts made; above 1 only for retried external builds.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suites: Vec<SuiteResult>,
}

impl StageResult {
    /// A stage that never started.
    #[must_use]
    pub fn not_started(name: &str, kind: &str, best_effort: bool, state: StageState) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            state,
            best_effort,
            duration_secs: 0.0,
            attempts: 0,
            error_kind: None,
            error: None,
            suites: Vec::new(),
        }
    }
}

/// Everything one instance produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOutcome {
    pub index: usize,
    pub label: String,
    pub values: BTreeMap<String, String>,
    pub status: RunStatus,
    /// First fatal error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub failing_suites: Vec<String>,
    pub stages: Vec<StageResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coverage: Option<CoverageSummary>,
    pub duration_secs: f64,
    pub dir: PathBuf,
}

impl InstanceOutcome {
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }
}

/// Result of a whole triggered run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub pipeline: String,
    pub git_ref: String,
    pub commit: String,
    pub status: RunStatus,
    pub dir: PathBuf,
    pub started_at: String,
    pub duration_secs: f64,
    pub instances: Vec<InstanceOutcome>,
}

impl RunOutcome {
    /// Process exit code for the CLI: 0 succeeded, 130 cancelled, 1 otherwise.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        exit_code_for(self.status)
    }

    #[must_use]
    pub fn instance(&self, label: &str) -> Option<&InstanceOutcome> {
        self.instances.iter().find(|i| i.label == label)
    }
}

#[must_use]
pub fn exit_code_for(status: RunStatus) -> i32 {
    match status {
        RunStatus::Succeeded => 0,
        RunStatus::Cancelled => 130,
        _ => 1,
    }
}
