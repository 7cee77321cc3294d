//! Run tracking model types.
//!
//! Pure data types used by `StateBackend` implementations and the
//! orchestrator. Kept in the types crate so the engine and state crates can
//! share them without circular dependencies.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Opaque pipeline identifier (the `pipeline` name from the YAML file).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PipelineId(String);

impl PipelineId {
    /// Create a new pipeline identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PipelineId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for PipelineId {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Source-control ref a run was triggered for (branch name or `pr-<n>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RefName(String);

impl RefName {
    /// Create a new ref name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Borrow the inner string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RefName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl<S: Into<String>> From<S> for RefName {
    fn from(value: S) -> Self {
        Self(value.into())
    }
}

/// Row id of a run in the state store.
pub type RunId = i64;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Lifecycle status shared by runs and instances.
///
/// `Cancelled`, `Succeeded` and `Failed` are terminal. Cancellation is kept
/// apart from failure so superseded work never reads as a defect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Cancelled,
    Succeeded,
    Failed,
}

impl RunStatus {
    /// Wire-format string for storage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "cancelled" => Some(Self::Cancelled),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Succeeded | Self::Failed)
    }

    /// Combine two verdicts, keeping the worse one.
    ///
    /// Cancellation dominates failure: a cancelled run is reported as
    /// cancelled even if some of its instances had already failed.
    #[must_use]
    pub fn worst(self, other: Self) -> Self {
        fn rank(s: RunStatus) -> u8 {
            match s {
                RunStatus::Succeeded => 0,
                RunStatus::Pending => 1,
                RunStatus::Running => 2,
                RunStatus::Failed => 3,
                RunStatus::Cancelled => 4,
            }
        }
        if rank(other) > rank(self) {
            other
        } else {
            self
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Triggers and records
// ---------------------------------------------------------------------------

/// A push or pull-request event that starts a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub git_ref: RefName,
    pub commit: String,
    /// Protected refs are never preempted by later triggers.
    pub is_protected: bool,
}

impl TriggerEvent {
    #[must_use]
    pub fn new(git_ref: impl Into<RefName>, commit: impl Into<String>, is_protected: bool) -> Self {
        Self {
            git_ref: git_ref.into(),
            commit: commit.into(),
            is_protected,
        }
    }
}

/// Persisted view of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: RunId,
    pub pipeline: PipelineId,
    pub git_ref: RefName,
    pub commit: String,
    pub is_protected: bool,
    pub status: RunStatus,
    /// OS process id of the orchestrator that owns the run.
    pub owner_pid: u32,
    /// ISO-8601 UTC timestamp.
    pub started_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Persisted view of one matrix instance within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub run_id: RunId,
    /// Stable label such as `python=3.8,os=linux`.
    pub instance: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failing_suites: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_rate: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipeline_id_display_and_as_str() {
        let pid = PipelineId::new("integration");
        assert_eq!(pid.as_str(), "integration");
        assert_eq!(pid.to_string(), "integration");
    }

    #[test]
    fn ref_name_from_and_display() {
        let r = RefName::from("pr-7");
        assert_eq!(r.as_str(), "pr-7");
        assert_eq!(r.to_string(), "pr-7");
    }

    #[test]
    fn run_status_storage_strings_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Cancelled,
            RunStatus::Succeeded,
            RunStatus::Failed,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("completed"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn worst_prefers_failure_over_success() {
        assert_eq!(
            RunStatus::Succeeded.worst(RunStatus::Failed),
            RunStatus::Failed
        );
        assert_eq!(
            RunStatus::Failed.worst(RunStatus::Succeeded),
            RunStatus::Failed
        );
    }

    #[test]
    fn worst_prefers_cancellation_over_failure() {
        assert_eq!(
            RunStatus::Failed.worst(RunStatus::Cancelled),
            RunStatus::Cancelled
        );
    }

    #[test]
    fn run_status_serde_snake_case() {
        let json = serde_json::to_string(&RunStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let back: RunStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, RunStatus::Cancelled);
    }

    #[test]
    fn ref_name_serde_transparent() {
        let json = serde_json::to_string(&RefName::new("main")).unwrap();
        assert_eq!(json, "\"main\"");
    }

    #[test]
    fn instance_record_carries_line_rate() {
        let record = InstanceRecord {
            run_id: 4,
            instance: "python=3.8".into(),
            status: RunStatus::Failed,
            error_kind: None,
            error_message: None,
            failing_suites: vec!["s2".into()],
            line_rate: Some(0.5),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"line_rate\":0.5"), "{json}");
        let back: InstanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
