use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use gantry_engine::config::parser;
use gantry_engine::result::exit_code_for;
use gantry_engine::{create_state_backend, Orchestrator, RunOutcome, StageState};
use gantry_types::state::{RunStatus, TriggerEvent};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;

/// Execute the `run` command: run every pipeline for one trigger, concurrently.
pub async fn execute(
    pipelines: &[PathBuf],
    git_ref: &str,
    commit: &str,
    protected: bool,
) -> Result<ExitCode> {
    // 1. Parse every pipeline before starting anything
    let mut jobs = Vec::with_capacity(pipelines.len());
    for path in pipelines {
        let config = parser::parse_pipeline(path)
            .with_context(|| format!("Failed to parse pipeline: {}", path.display()))?;
        let plan = gantry_engine::plan(&config)?;
        tracing::info!(
            pipeline = config.pipeline,
            instances = plan.instances.len(),
            stages = config.stages.len(),
            "Pipeline validated"
        );
        let state = create_state_backend(&config)?;
        jobs.push((config, Arc::new(Orchestrator::new(state))));
    }

    // 2. SIGINT/SIGTERM cancel everything this process owns
    let orchestrators: Vec<Arc<Orchestrator>> = jobs.iter().map(|(_, o)| Arc::clone(o)).collect();
    let signals = tokio::spawn(forward_signals(orchestrators));

    // 3. Run
    let trigger = TriggerEvent::new(git_ref, commit, protected);
    let mut join_set = JoinSet::new();
    for (config, orchestrator) in jobs {
        let trigger = trigger.clone();
        join_set.spawn(async move { orchestrator.run(&config, &trigger).await });
    }

    let mut outcomes = Vec::new();
    let mut first_error = None;
    while let Some(joined) = join_set.join_next().await {
        match joined.context("Run task panicked").and_then(|r| r) {
            Ok(outcome) => outcomes.push(outcome),
            Err(e) => {
                tracing::error!("Run failed: {e:#}");
                first_error.get_or_insert(e);
            }
        }
    }
    signals.abort();

    outcomes.sort_by(|a, b| a.pipeline.cmp(&b.pipeline));
    for outcome in &outcomes {
        print_outcome(outcome);
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    let status = outcomes
        .iter()
        .fold(RunStatus::Succeeded, |acc, o| acc.worst(o.status));
    let code = u8::try_from(exit_code_for(status)).unwrap_or(1);
    Ok(ExitCode::from(code))
}

/// SIGINT cancels everything. SIGTERM usually comes from another gantry
/// process superseding one of our runs, so it cancels only the runs the
/// state store marks cancelled, and everything if none is marked.
async fn forward_signals(orchestrators: Vec<Arc<Orchestrator>>) {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("Cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            cancel_all(&orchestrators);
            return;
        }
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                cancel_all(&orchestrators);
                return;
            }
            received = terminate.recv() => {
                if received.is_none() || cancel_superseded(&orchestrators) == 0 {
                    cancel_all(&orchestrators);
                    return;
                }
            }
        }
    }
}

fn cancel_superseded(orchestrators: &[Arc<Orchestrator>]) -> usize {
    let mut cancelled = 0;
    for orchestrator in orchestrators {
        match orchestrator.cancel_marked() {
            Ok(n) => cancelled += n,
            Err(e) => tracing::error!("Failed to read run state: {e:#}"),
        }
    }
    if cancelled > 0 {
        tracing::warn!(cancelled, "Runs superseded by another process, cancelling them");
    }
    cancelled
}

fn cancel_all(orchestrators: &[Arc<Orchestrator>]) {
    tracing::warn!("Interrupted, cancelling runs");
    for orchestrator in orchestrators {
        orchestrator.cancel_all();
    }
}

fn print_outcome(outcome: &RunOutcome) {
    println!(
        "Pipeline '{}' run {} ({} @ {}): {}",
        outcome.pipeline, outcome.run_id, outcome.git_ref, outcome.commit, outcome.status
    );
    for instance in &outcome.instances {
        println!("  {:32} {}", instance.label, instance.status);
        if let Some(error) = &instance.error {
            println!("    error:          {error}");
        }
        if !instance.failing_suites.is_empty() {
            println!("    failing suites: {}", instance.failing_suites.join(", "));
        }
        let skipped = instance
            .stages
            .iter()
            .filter(|s| s.state == StageState::Skipped)
            .count();
        if skipped > 0 {
            println!("    skipped stages: {skipped}");
        }
        if let Some(coverage) = &instance.coverage {
            println!(
                "    coverage:       {:.1}% ({}/{} lines)",
                coverage.line_rate * 100.0,
                coverage.lines_covered,
                coverage.lines_total
            );
        }
    }
    println!("  Duration:  {:.2}s", outcome.duration_secs);
    println!("  Results:   {}", outcome.dir.display());
}
