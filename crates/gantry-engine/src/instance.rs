//! Runs one pipeline instance: its stages in dependency order, with
//! independent stages running concurrently.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use gantry_types::coverage::CoverageSummary;
use gantry_types::state::RunStatus;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::cache::SharedCache;
use crate::config::types::PipelineConfig;
use crate::context::{ExecutionContext, InstanceLayout, Provisioner};
use crate::coverage::{self, ArtifactRef};
use crate::dag::StageGraph;
use crate::errors::StageError;
use crate::matrix::InstanceSpec;
use crate::process::Supervision;
use crate::result::{InstanceOutcome, StageResult, StageState};
use crate::stages::{self, StageEnv, StageRun};
use crate::template::Vars;

/// Everything needed to run one instance.
pub struct InstancePlan {
    pub config: Arc<PipelineConfig>,
    pub graph: Arc<StageGraph>,
    pub spec: InstanceSpec,
    pub layout: InstanceLayout,
    /// Absolute workspace path.
    pub workspace: PathBuf,
    /// Run-level bindings (`run.id`, `git.ref`, ...).
    pub run_vars: Vars,
    pub token: CancellationToken,
    pub cache: Arc<SharedCache>,
    pub provisioner: Arc<dyn Provisioner>,
}

struct FatalError {
    kind: &'static str,
    message: String,
}

/// Mutable bookkeeping of a running instance.
struct InstanceState {
    ctx: ExecutionContext,
    results: Vec<Option<StageResult>>,
    running: HashSet<usize>,
    fatal: Option<FatalError>,
    failing_suites: Vec<String>,
    artifacts: Vec<ArtifactRef>,
    coverage: Option<CoverageSummary>,
}

impl InstancePlan {
    fn instance_vars(&self) -> Vars {
        let mut vars = self.run_vars.clone();
        for (axis, value) in &self.spec.values {
            vars.insert(format!("matrix.{axis}"), value.as_str());
        }
        vars.insert("instance.id", self.spec.slug());
        vars.insert("instance.dir", self.layout.root.to_string_lossy());
        vars.insert("instance.work_dir", self.layout.work.to_string_lossy());
        vars.insert("workspace", self.workspace.to_string_lossy());
        vars
    }

    fn stage_env(&self, index: usize, state: &InstanceState, invocations: &Arc<AtomicUsize>) -> StageEnv {
        let stage = &self.config.stages[index];
        let defaults = &self.config.defaults;
        let timeout = Duration::from_secs(
            stage
                .timeout_seconds
                .unwrap_or(defaults.stage_timeout_seconds),
        );
        StageEnv {
            stage: stage.name.clone(),
            instance: self.spec.label(),
            ctx: state.ctx.clone(),
            supervision: Supervision::new(
                timeout,
                Duration::from_secs(defaults.kill_grace_seconds),
                self.token.clone(),
            ),
            log: self.layout.stage_log(&stage.name),
            cache: Arc::clone(&self.cache),
            provisioner: Arc::clone(&self.provisioner),
            invocations: Arc::clone(invocations),
            artifacts: state.artifacts.clone(),
        }
    }
}

/// Run every stage of one instance and write its `results.json`.
///
/// Never fails: every problem is folded into the returned outcome.
pub async fn run_instance(plan: InstancePlan) -> InstanceOutcome {
    let started = Instant::now();
    let label = plan.spec.label();
    tracing::info!(instance = %label, dir = %plan.layout.root.display(), "Starting instance");

    let stage_count = plan.config.stages.len();
    let mut state = InstanceState {
        ctx: ExecutionContext::new(
            plan.workspace.clone(),
            plan.layout.clone(),
            plan.instance_vars(),
        ),
        results: vec![None; stage_count],
        running: HashSet::new(),
        fatal: None,
        failing_suites: Vec::new(),
        artifacts: Vec::new(),
        coverage: None,
    };

    if let Err(e) = plan.layout.create() {
        state.fatal = Some(FatalError {
            kind: "infrastructure",
            message: format!("cannot create instance directory: {e}"),
        });
    }

    let invocations = Arc::new(AtomicUsize::new(0));
    let mut join_set: JoinSet<(usize, StageRun, f64)> = JoinSet::new();

    loop {
        schedule_ready(&plan, &mut state, &mut join_set, &invocations);

        if join_set.is_empty() {
            break;
        }
        match join_set.join_next().await {
            Some(Ok((index, run, duration_secs))) => {
                state.running.remove(&index);
                record_stage(&plan, &mut state, index, run, duration_secs);
            }
            Some(Err(join_err)) => {
                tracing::error!(instance = %label, "Stage task panicked: {join_err}");
                if state.fatal.is_none() {
                    state.fatal = Some(FatalError {
                        kind: "infrastructure",
                        message: format!("stage task panicked: {join_err}"),
                    });
                }
            }
            None => break,
        }
    }

    // A panicked task leaves its stage without a result.
    for index in std::mem::take(&mut state.running) {
        let stage = &plan.config.stages[index];
        let mut result = StageResult::not_started(
            &stage.name,
            stage.action.kind(),
            stage.is_best_effort(),
            StageState::Failed,
        );
        result.error_kind = Some("infrastructure".to_string());
        result.error = Some("stage task panicked".to_string());
        state.results[index] = Some(result);
    }

    finish(plan, state, started.elapsed().as_secs_f64())
}

/// Start, skip or cancel every stage whose predecessors are all terminal.
fn schedule_ready(
    plan: &InstancePlan,
    state: &mut InstanceState,
    join_set: &mut JoinSet<(usize, StageRun, f64)>,
    invocations: &Arc<AtomicUsize>,
) {
    // Skips and cancellations unblock later stages, so sweep until stable.
    let mut changed = true;
    while changed {
        changed = false;
        for index in 0..plan.config.stages.len() {
            if state.results[index].is_some() || state.running.contains(&index) {
                continue;
            }
            let deps = plan.graph.deps(index);
            if deps.iter().any(|&d| state.results[d].is_none()) {
                continue;
            }

            let stage = &plan.config.stages[index];
            let best_effort = stage.is_best_effort();
            let not_started = |s| StageResult::not_started(&stage.name, stage.action.kind(), best_effort, s);

            if plan.token.is_cancelled() {
                state.results[index] = Some(not_started(StageState::Cancelled));
                changed = true;
                continue;
            }
            let upstream_blocked = deps.iter().any(|&d| {
                let dep = state.results[d].as_ref();
                dep.is_some_and(|r| {
                    !r.best_effort && matches!(r.state, StageState::Skipped | StageState::Cancelled)
                })
            });
            if !best_effort && (state.fatal.is_some() || upstream_blocked) {
                tracing::info!(instance = %plan.spec.label(), stage = %stage.name, "Skipping stage after fatal error");
                state.results[index] = Some(not_started(StageState::Skipped));
                changed = true;
                continue;
            }

            let env = plan.stage_env(index, state, invocations);
            let config = Arc::clone(&plan.config);
            tracing::info!(instance = %env.instance, stage = %env.stage, kind = stage.action.kind(), "Starting stage");
            state.running.insert(index);
            join_set.spawn(async move {
                let started = Instant::now();
                let run = stages::execute(&config.stages[index], &env).await;
                (index, run, started.elapsed().as_secs_f64())
            });
        }
    }
}

fn record_stage(
    plan: &InstancePlan,
    state: &mut InstanceState,
    index: usize,
    run: StageRun,
    duration_secs: f64,
) {
    let stage = &plan.config.stages[index];
    let best_effort = stage.is_best_effort();
    let label = plan.spec.label();
    let StageRun { output, error } = run;

    state.ctx.apply(output.delta);
    if !output.consumed.is_empty() {
        state.artifacts.retain(|a| !output.consumed.contains(&a.path));
    }
    state.artifacts.extend(output.artifacts);
    if output.coverage.is_some() {
        state.coverage = output.coverage;
    }

    let stage_state = match &error {
        None => StageState::Succeeded,
        Some(StageError::Cancelled) => StageState::Cancelled,
        Some(_) => StageState::Failed,
    };

    if let Some(err) = &error {
        if best_effort && !matches!(err, StageError::Cancelled) {
            tracing::warn!(instance = %label, stage = %stage.name, error = %err, "Best-effort stage failed");
        } else if err.is_fatal() {
            tracing::error!(instance = %label, stage = %stage.name, kind = err.kind(), error = %err, "Stage failed");
            if state.fatal.is_none() {
                state.fatal = Some(FatalError {
                    kind: err.kind(),
                    message: format!("stage '{}': {err}", stage.name),
                });
            }
        } else if let StageError::TestFailure { failing_suites } = err {
            tracing::warn!(instance = %label, stage = %stage.name, failing = ?failing_suites, "Suites failed");
            state.failing_suites.extend(failing_suites.iter().cloned());
        }
    } else {
        tracing::info!(instance = %label, stage = %stage.name, duration_secs, "Stage succeeded");
    }

    state.results[index] = Some(StageResult {
        name: stage.name.clone(),
        kind: stage.action.kind().to_string(),
        state: stage_state,
        best_effort,
        duration_secs,
        attempts: output.attempts,
        error_kind: error.as_ref().map(|e| e.kind().to_string()),
        error: error.as_ref().map(ToString::to_string),
        suites: output.suites,
    });
}

fn finish(plan: InstancePlan, mut state: InstanceState, duration_secs: f64) -> InstanceOutcome {
    let label = plan.spec.label();
    let stages: Vec<StageResult> = state.results.into_iter().flatten().collect();

    // Artifacts no report stage folded in still end up in the instance's
    // single combined report.
    if !state.artifacts.is_empty() {
        match coverage::extend_report(&label, &plan.layout.combined_report(), &state.artifacts) {
            Ok(report) => state.coverage = Some(report.summary()),
            Err(e) => tracing::warn!(instance = %label, error = %e, "Failed to write combined report"),
        }
    }

    let cancelled = stages.iter().any(|s| s.state == StageState::Cancelled);
    let status = if cancelled {
        RunStatus::Cancelled
    } else if state.fatal.is_some() || !state.failing_suites.is_empty() {
        RunStatus::Failed
    } else {
        RunStatus::Succeeded
    };

    let outcome = InstanceOutcome {
        index: plan.spec.index,
        label: label.clone(),
        values: plan.spec.values.iter().cloned().collect::<BTreeMap<_, _>>(),
        status,
        error_kind: state.fatal.as_ref().map(|f| f.kind.to_string()),
        error: state.fatal.map(|f| f.message),
        failing_suites: state.failing_suites,
        stages,
        coverage: state.coverage,
        duration_secs,
        dir: plan.layout.root.clone(),
    };

    match serde_json::to_vec_pretty(&outcome) {
        Ok(json) => {
            if let Err(e) = std::fs::write(plan.layout.results_file(), json) {
                tracing::warn!(instance = %label, error = %e, "Failed to write results.json");
            }
        }
        Err(e) => tracing::warn!(instance = %label, error = %e, "Failed to serialize results"),
    }

    if !plan.config.output.keep_workdirs && plan.layout.work.exists() {
        if let Err(e) = std::fs::remove_dir_all(&plan.layout.work) {
            tracing::warn!(instance = %label, error = %e, "Failed to remove work directory");
        }
    }

    tracing::info!(
        instance = %label,
        status = %outcome.status,
        failing_suites = outcome.failing_suites.len(),
        duration_secs,
        "Instance finished"
    );
    outcome
}
