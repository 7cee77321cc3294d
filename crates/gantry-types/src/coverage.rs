//! Coverage artifact and combined report types.
//!
//! Line-hit data is kept in ordered maps so that serialization is
//! deterministic: merging the same artifacts in any order produces
//! byte-identical JSON.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Hit counts per line, per source file.
///
/// This is also the on-disk format a suite writes to `GANTRY_COVERAGE_FILE`:
///
/// ```json
/// { "files": { "src/node.py": { "10": 3, "11": 0 } } }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageData {
    #[serde(default)]
    pub files: BTreeMap<String, BTreeMap<u32, u64>>,
}

impl CoverageData {
    /// Add `other`'s hit counts into `self`.
    ///
    /// Files and lines are unioned and counts add, so the operation is
    /// associative and commutative.
    pub fn merge(&mut self, other: &CoverageData) {
        for (file, lines) in &other.files {
            let target = self.files.entry(file.clone()).or_default();
            for (line, hits) in lines {
                let slot = target.entry(*line).or_insert(0);
                *slot = slot.saturating_add(*hits);
            }
        }
    }

    /// Number of instrumented lines across all files.
    #[must_use]
    pub fn lines_total(&self) -> u64 {
        self.files.values().map(|lines| lines.len() as u64).sum()
    }

    /// Number of instrumented lines hit at least once.
    #[must_use]
    pub fn lines_covered(&self) -> u64 {
        self.files
            .values()
            .map(|lines| lines.values().filter(|hits| **hits > 0).count() as u64)
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Coverage produced by one Test Runner invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageArtifact {
    /// Instance label the artifact belongs to.
    pub instance: String,
    /// Position of the invocation within the instance (0-based).
    pub invocation: usize,
    pub suite: String,
    pub data: CoverageData,
}

/// Aggregate line statistics of a report.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoverageSummary {
    pub lines_total: u64,
    pub lines_covered: u64,
    /// Covered / total in `[0, 1]`; `1.0` when nothing is instrumented.
    pub line_rate: f64,
}

/// Merged coverage for one instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombinedReport {
    pub instance: String,
    /// `<invocation>:<suite>` labels of every merged artifact.
    pub sources: BTreeSet<String>,
    pub data: CoverageData,
}

impl CombinedReport {
    #[must_use]
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
            ..Self::default()
        }
    }

    /// Fold one artifact into the report.
    pub fn absorb(&mut self, artifact: &CoverageArtifact) {
        self.sources
            .insert(format!("{}:{}", artifact.invocation, artifact.suite));
        self.data.merge(&artifact.data);
    }

    /// Merge another report for the same instance.
    pub fn merge(&mut self, other: &CombinedReport) {
        self.sources.extend(other.sources.iter().cloned());
        self.data.merge(&other.data);
    }

    #[must_use]
    pub fn summary(&self) -> CoverageSummary {
        let lines_total = self.data.lines_total();
        let lines_covered = self.data.lines_covered();
        #[allow(clippy::cast_precision_loss)]
        let line_rate = if lines_total == 0 {
            1.0
        } else {
            lines_covered as f64 / lines_total as f64
        };
        CoverageSummary {
            lines_total,
            lines_covered,
            line_rate,
        }
    }
}
