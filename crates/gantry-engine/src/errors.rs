//! Stage error model and retry backoff policy helpers.

use std::time::Duration;

const BACKOFF_MAX_MS: u64 = 60_000;

/// Sub-step of an external component build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternalStep {
    Clone,
    Checkout,
    Install,
    Build,
    Expose,
}

impl ExternalStep {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Clone => "clone",
            Self::Checkout => "checkout",
            Self::Install => "install",
            Self::Build => "build",
            Self::Expose => "expose",
        }
    }
}

impl std::fmt::Display for ExternalStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Categorized stage error.
///
/// Everything except [`StageError::TestFailure`] and
/// [`StageError::Cancelled`] is fatal to the instance: remaining
/// non-best-effort stages are skipped.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("toolchain {family} {version} unavailable: {reason}")]
    Provision {
        family: String,
        version: String,
        reason: String,
    },
    #[error("dependency resolution failed: {0}")]
    DependencyResolution(String),
    #[error("compilation failed: {0}")]
    Compilation(String),
    #[error("external build failed at {step}: {message}")]
    ExternalBuild { step: ExternalStep, message: String },
    #[error("failing suites: {}", failing_suites.join(", "))]
    TestFailure { failing_suites: Vec<String> },
    #[error("stage '{stage}' timed out after {}s", after.as_secs())]
    Timeout { stage: String, after: Duration },
    #[error("cancelled")]
    Cancelled,
    #[error("command `{command}` exited with code {code}")]
    CommandFailed { command: String, code: i32 },
    #[error(transparent)]
    Infrastructure(#[from] anyhow::Error),
}

impl From<std::io::Error> for StageError {
    fn from(e: std::io::Error) -> Self {
        Self::Infrastructure(e.into())
    }
}

impl StageError {
    /// Stable name recorded in the state store and `results.json`.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provision { .. } => "provision",
            Self::DependencyResolution(_) => "dependency_resolution",
            Self::Compilation(_) => "compilation",
            Self::ExternalBuild { .. } => "external_build",
            Self::TestFailure { .. } => "test_failure",
            Self::Timeout { .. } => "timeout",
            Self::Cancelled => "cancelled",
            Self::CommandFailed { .. } => "command_failed",
            Self::Infrastructure(_) => "infrastructure",
        }
    }

    /// Whether the error stops the instance's remaining stages.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::TestFailure { .. } | Self::Cancelled)
    }

    /// Whether a bounded retry of the same stage may succeed.
    ///
    /// Only external builds retry; everything they touch is recreated from
    /// a clean clone path on each attempt.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ExternalBuild { .. })
    }

    #[must_use]
    pub fn failing_suites(&self) -> &[String] {
        match self {
            Self::TestFailure { failing_suites } => failing_suites,
            _ => &[],
        }
    }
}

/// Exponential retry delay: `base_ms * 2^(attempt-1)`, capped at 60s.
#[must_use]
pub fn compute_backoff(base_ms: u64, attempt: u32) -> Duration {
    let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
    let delay_ms = base_ms.saturating_mul(factor);
    Duration::from_millis(delay_ms.min(BACKOFF_MAX_MS))
}
