//! Coverage artifact files and per-instance aggregation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use gantry_types::coverage::{CombinedReport, CoverageArtifact, CoverageData};

/// Environment variable telling a suite where to write its coverage.
pub const COVERAGE_FILE_ENV: &str = "GANTRY_COVERAGE_FILE";

/// An artifact file produced by a test stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub path: PathBuf,
    /// Removed once folded into the combined report.
    pub combined: bool,
}

/// File name for one invocation's artifact.
#[must_use]
pub fn artifact_file_name(invocation: usize, suite: &str) -> String {
    let suite: String = suite
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{invocation:04}-{suite}.json")
}

/// Read the raw hit data a suite wrote, if it wrote any.
///
/// # Errors
///
/// Returns an error if the file exists but is not valid coverage JSON.
pub fn read_raw(path: &Path) -> Result<Option<CoverageData>> {
    if !path.is_file() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read coverage file {}", path.display()))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let data = serde_json::from_slice(&bytes)
        .with_context(|| format!("Invalid coverage JSON in {}", path.display()))?;
    Ok(Some(data))
}

/// Replace the raw file with an attributed [`CoverageArtifact`].
///
/// # Errors
///
/// Returns an error if the artifact cannot be serialized or written.
pub fn write_artifact(path: &Path, artifact: &CoverageArtifact) -> Result<()> {
    let json = serde_json::to_vec_pretty(artifact)?;
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write coverage artifact {}", path.display()))
}

fn load_artifact(path: &Path) -> Result<CoverageArtifact> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("Failed to read coverage artifact {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("Invalid coverage artifact {}", path.display()))
}

/// Merge artifacts into one report for `instance`.
///
/// Unreadable artifacts are skipped with a warning. Artifacts produced in
/// combined mode are deleted after a successful merge.
#[must_use]
pub fn aggregate(instance: &str, artifacts: &[ArtifactRef]) -> CombinedReport {
    let mut report = CombinedReport::new(instance);
    for artifact in artifacts {
        match load_artifact(&artifact.path) {
            Ok(loaded) => report.absorb(&loaded),
            Err(e) => {
                tracing::warn!(path = %artifact.path.display(), error = %e, "Skipping coverage artifact");
                continue;
            }
        }
        if artifact.combined {
            if let Err(e) = std::fs::remove_file(&artifact.path) {
                tracing::warn!(path = %artifact.path.display(), error = %e, "Failed to remove merged artifact");
            }
        }
    }
    report
}

/// Serialize a report deterministically to `path`.
///
/// # Errors
///
/// Returns an error if the report cannot be written.
pub fn write_report(path: &Path, report: &CombinedReport) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(report)?;
    json.push(b'\n');
    std::fs::write(path, json)
        .with_context(|| format!("Failed to write combined report {}", path.display()))
}

/// Fold `artifacts` into the combined report at `path`, on top of whatever
/// an earlier aggregation of the same instance already wrote there.
///
/// # Errors
///
/// Returns an error if an existing report cannot be read or the result
/// cannot be written.
pub fn extend_report(instance: &str, path: &Path, artifacts: &[ArtifactRef]) -> Result<CombinedReport> {
    let mut report = match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("Invalid combined report {}", path.display()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => CombinedReport::new(instance),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read combined report {}", path.display()))
        }
    };
    report.merge(&aggregate(instance, artifacts));
    write_report(path, &report)?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn data(file: &str, lines: &[(u32, u64)]) -> CoverageData {
        CoverageData {
            files: BTreeMap::from([(file.to_string(), lines.iter().copied().collect())]),
        }
    }

    fn artifact(dir: &Path, invocation: usize, suite: &str, combined: bool) -> ArtifactRef {
        let path = dir.join(artifact_file_name(invocation, suite));
        write_artifact(
            &path,
            &CoverageArtifact {
                instance: "py=3.8".into(),
                invocation,
                suite: suite.into(),
                data: data("src/a.py", &[(1, 1), (invocation as u32 + 2, 0)]),
            },
        )
        .unwrap();
        ArtifactRef { path, combined }
    }

    #[test]
    fn raw_file_formats() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.json");
        assert!(read_raw(&path).unwrap().is_none());

        std::fs::write(&path, "  \n").unwrap();
        assert!(read_raw(&path).unwrap().is_none());

        std::fs::write(&path, r#"{"files":{"a.py":{"3":2}}}"#).unwrap();
        let parsed = read_raw(&path).unwrap().unwrap();
        assert_eq!(parsed.files["a.py"][&3], 2);

        std::fs::write(&path, "not json").unwrap();
        assert!(read_raw(&path).is_err());
    }

    #[test]
    fn combined_artifacts_are_removed_isolated_kept() {
        let dir = tempfile::tempdir().unwrap();
        let kept = artifact(dir.path(), 0, "unit", false);
        let merged = artifact(dir.path(), 1, "integration", true);

        let report = aggregate("py=3.8", &[kept.clone(), merged.clone()]);
        assert_eq!(report.sources.len(), 2);
        assert_eq!(report.data.files["src/a.py"][&1], 2);
        assert!(kept.path.exists());
        assert!(!merged.path.exists());
    }

    #[test]
    fn report_bytes_independent_of_artifact_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = artifact(dir.path(), 0, "a", false);
        let b = artifact(dir.path(), 1, "b", false);

        let forward = dir.path().join("forward.json");
        let backward = dir.path().join("backward.json");
        write_report(&forward, &aggregate("i", &[a.clone(), b.clone()])).unwrap();
        write_report(&backward, &aggregate("i", &[b, a])).unwrap();
        assert_eq!(
            std::fs::read(&forward).unwrap(),
            std::fs::read(&backward).unwrap()
        );
    }

    #[test]
    fn corrupt_artifact_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = artifact(dir.path(), 0, "a", true);
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{").unwrap();
        let report = aggregate(
            "i",
            &[
                good,
                ArtifactRef {
                    path: bad.clone(),
                    combined: true,
                },
            ],
        );
        assert_eq!(report.sources.len(), 1);
        assert!(bad.exists(), "unreadable artifacts are left for inspection");
    }

    #[test]
    fn artifact_names_are_ordered_and_safe() {
        assert_eq!(artifact_file_name(7, "unit tests"), "0007-unit_tests.json");
    }

    #[test]
    fn extend_report_builds_on_an_earlier_aggregation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("combined-coverage.json");
        let first = artifact(dir.path(), 0, "unit", true);
        let second = artifact(dir.path(), 1, "integration", false);

        let report = extend_report("py=3.8", &path, &[first]).unwrap();
        assert_eq!(report.sources.len(), 1);
        let report = extend_report("py=3.8", &path, &[second]).unwrap();
        assert_eq!(report.sources.len(), 2);
        assert_eq!(report.data.files["src/a.py"][&1], 2);

        let on_disk: CombinedReport = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, report);
    }
}
