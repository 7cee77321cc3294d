use crate::config::types::{ReportStage, ReporterConfig};
use crate::coverage;
use crate::errors::StageError;

use super::{StageEnv, StageOutput};

/// Aggregate the instance's coverage and hand the report to the reporter.
///
/// Reporter failures are logged and never fail the stage; only
/// cancellation and a report that cannot be written do.
pub(super) async fn run(stage: &ReportStage, env: &StageEnv) -> Result<StageOutput, StageError> {
    let path = env.ctx.layout.combined_report();
    let report = coverage::extend_report(&env.instance, &path, &env.artifacts)?;
    let summary = report.summary();
    tracing::info!(
        instance = %env.instance,
        sources = report.sources.len(),
        lines_total = summary.lines_total,
        lines_covered = summary.lines_covered,
        line_rate = summary.line_rate,
        "Combined coverage report written"
    );

    let delivered = match &stage.reporter {
        ReporterConfig::None => Ok(()),
        ReporterConfig::File { dir } => {
            let dest_dir = env
                .ctx
                .workspace_path(&env.render_path(&env.ctx.vars, dir)?);
            let name = env
                .ctx
                .layout
                .root
                .file_name()
                .map_or_else(|| "report".into(), |n| n.to_string_lossy().into_owned());
            std::fs::create_dir_all(&dest_dir)
                .and_then(|()| std::fs::copy(&path, dest_dir.join(format!("{name}.json"))))
                .map(|_| ())
                .map_err(|e| StageError::Infrastructure(e.into()))
        }
        ReporterConfig::Command { command } => {
            let vars = env.ctx.vars.with("report", path.to_string_lossy());
            let command = env.command(&vars, command)?;
            env.exec_ok(&command, &env.ctx.workspace, &[], |message| {
                StageError::Infrastructure(anyhow::anyhow!(message))
            })
            .await
        }
    };

    match delivered {
        Err(StageError::Cancelled) => return Err(StageError::Cancelled),
        Err(e) => {
            tracing::warn!(instance = %env.instance, error = %e, "Coverage upload failed");
            env.note(&format!("coverage upload failed: {e}"));
        }
        Ok(()) => {}
    }

    Ok(StageOutput {
        consumed: env.artifacts.iter().map(|a| a.path.clone()).collect(),
        coverage: Some(summary),
        attempts: 1,
        ..StageOutput::default()
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use gantry_types::coverage::{CombinedReport, CoverageArtifact, CoverageData};

    use super::*;
    use crate::config::types::CommandLine;
    use crate::coverage::ArtifactRef;
    use crate::stages::testing;

    fn seed_artifacts(env: &mut crate::stages::StageEnv, combined: bool) {
        for (invocation, suite) in ["unit", "integration"].iter().enumerate() {
            let path = env
                .ctx
                .layout
                .coverage
                .join(coverage::artifact_file_name(invocation, suite));
            coverage::write_artifact(
                &path,
                &CoverageArtifact {
                    instance: "default".into(),
                    invocation,
                    suite: (*suite).into(),
                    data: CoverageData {
                        files: BTreeMap::from([(
                            "src/a.py".to_string(),
                            BTreeMap::from([(1, 1), (2, 0)]),
                        )]),
                    },
                },
            )
            .unwrap();
            env.artifacts.push(ArtifactRef { path, combined });
        }
    }

    #[tokio::test]
    async fn combined_report_written_and_per_invocation_files_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = testing::env(dir.path(), "coverage");
        seed_artifacts(&mut env, true);

        let stage = ReportStage {
            reporter: ReporterConfig::None,
        };
        let output = run(&stage, &env).await.unwrap();
        let summary = output.coverage.unwrap();
        assert_eq!(summary.lines_total, 2);
        assert_eq!(summary.lines_covered, 1);
        assert_eq!(output.consumed.len(), 2);
        assert!(env.artifacts.iter().all(|a| !a.path.exists()));

        let report: CombinedReport = serde_json::from_slice(
            &std::fs::read(env.ctx.layout.combined_report()).unwrap(),
        )
        .unwrap();
        assert_eq!(report.data.files["src/a.py"][&1], 2);
    }

    #[tokio::test]
    async fn failing_upload_is_only_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = testing::env(dir.path(), "coverage");
        seed_artifacts(&mut env, false);
        let stage = ReportStage {
            reporter: ReporterConfig::Command {
                command: CommandLine::Shell("test -f {{ report }} && exit 7".into()),
            },
        };
        let output = run(&stage, &env).await.unwrap();
        assert!(output.coverage.is_some());
        // Folded into the report, but isolated files stay on disk.
        assert_eq!(output.consumed.len(), 2);
        assert!(env.artifacts.iter().all(|a| a.path.exists()));
        let log = std::fs::read_to_string(&env.log).unwrap();
        assert!(log.contains("coverage upload failed"));
    }

    #[tokio::test]
    async fn file_reporter_copies_report() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = testing::env(dir.path(), "coverage");
        seed_artifacts(&mut env, false);
        let stage = ReportStage {
            reporter: ReporterConfig::File {
                dir: "reports".into(),
            },
        };
        run(&stage, &env).await.unwrap();
        assert!(env.ctx.workspace.join("reports/inst.json").is_file());
    }
}
