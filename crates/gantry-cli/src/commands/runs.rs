use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};
use gantry_state::{RunFilter, SqliteStateBackend, StateBackend};
use gantry_types::state::{PipelineId, RefName};

/// Execute the `runs` command: list recorded runs, newest first.
pub fn execute(
    state_path: &Path,
    pipeline: Option<String>,
    git_ref: Option<String>,
    limit: u32,
    show_instances: bool,
) -> Result<ExitCode> {
    let state = SqliteStateBackend::open(state_path)
        .with_context(|| format!("Failed to open state DB {}", state_path.display()))?;
    let filter = RunFilter {
        pipeline: pipeline.map(PipelineId::new),
        git_ref: git_ref.map(RefName::new),
        limit: Some(limit),
    };
    let runs = state.list_runs(&filter)?;
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(ExitCode::SUCCESS);
    }

    println!(
        "{:>6}  {:16} {:16} {:10} {:10} {:20}",
        "ID", "PIPELINE", "REF", "COMMIT", "STATUS", "STARTED"
    );
    for run in &runs {
        let commit: String = run.commit.chars().take(10).collect();
        let protected = if run.is_protected { " *" } else { "" };
        println!(
            "{:>6}  {:16} {:16} {:10} {:10} {:20}{protected}",
            run.id,
            run.pipeline.as_str(),
            run.git_ref.as_str(),
            commit,
            run.status.as_str(),
            run.started_at
        );
        if let Some(message) = &run.error_message {
            println!("        {message}");
        }
        if show_instances {
            for instance in state.list_instances(run.id)? {
                let rate = instance
                    .line_rate
                    .map(|r| format!(" coverage {:.1}%", r * 100.0))
                    .unwrap_or_default();
                println!(
                    "        {:32} {}{rate}",
                    instance.instance,
                    instance.status.as_str()
                );
                if !instance.failing_suites.is_empty() {
                    println!("          failing: {}", instance.failing_suites.join(", "));
                }
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}
