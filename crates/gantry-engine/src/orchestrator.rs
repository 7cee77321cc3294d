//! Run orchestration: trigger handling, matrix fan-out and run finalization.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use gantry_state::{SqliteStateBackend, StateBackend};
use gantry_types::state::{InstanceRecord, PipelineId, RunId, RunStatus, TriggerEvent};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::SharedCache;
use crate::cancel::{CancellationController, RunTicket};
use crate::config::types::{PipelineConfig, StateBackendKind};
use crate::config::validator::validate_pipeline;
use crate::context::{DirectoryProvisioner, InstanceLayout, Provisioner};
use crate::dag::StageGraph;
use crate::instance::{run_instance, InstancePlan};
use crate::matrix::{self, InstanceSpec};
use crate::result::{InstanceOutcome, RunOutcome};
use crate::template::Vars;

/// Timestamp format of run directory names.
const RUN_DIR_TIME_FMT: &str = "%Y-%m-%d_%H.%M.%S";

/// Open the state backend a pipeline is configured with.
///
/// # Errors
///
/// Returns an error if the database cannot be opened.
pub fn create_state_backend(config: &PipelineConfig) -> Result<Arc<dyn StateBackend>> {
    match config.state.backend {
        StateBackendKind::Sqlite => {
            let path = config
                .state
                .connection
                .clone()
                .unwrap_or_else(|| config.output.dir.join("state.db"));
            let backend = SqliteStateBackend::open(&path)
                .with_context(|| format!("Failed to open state DB {}", path.display()))?;
            Ok(Arc::new(backend) as Arc<dyn StateBackend>)
        }
    }
}

/// Instances and stage order a pipeline expands to, without running it.
#[derive(Debug)]
pub struct RunPlan {
    pub instances: Vec<InstanceSpec>,
    pub graph: StageGraph,
}

/// Validate a pipeline and expand its matrix and stage graph.
///
/// # Errors
///
/// Returns every validation problem in one error.
pub fn plan(config: &PipelineConfig) -> Result<RunPlan> {
    validate_pipeline(config)?;
    let instances = matrix::expand(config.matrix.as_ref()).context("Invalid matrix")?;
    let graph = StageGraph::build(&config.stages)
        .map_err(|errors| anyhow::anyhow!("Invalid stage graph:\n  - {}", errors.join("\n  - ")))?;
    Ok(RunPlan { instances, graph })
}

/// Result of `gantry check`.
#[derive(Debug)]
pub struct CheckResult {
    pub state: bool,
    pub workspace: bool,
    pub instances: usize,
}

impl CheckResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.state && self.workspace
    }
}

/// Validate a pipeline and probe the resources it needs.
///
/// # Errors
///
/// Returns an error if the pipeline itself is invalid.
pub fn check_pipeline(config: &PipelineConfig) -> Result<CheckResult> {
    let plan = plan(config)?;
    let state = match create_state_backend(config) {
        Ok(_) => {
            tracing::info!("State backend: OK");
            true
        }
        Err(e) => {
            tracing::error!("State backend: FAILED ({e:#})");
            false
        }
    };
    let workspace = config.workspace.is_dir();
    if workspace {
        tracing::info!(workspace = %config.workspace.display(), "Workspace: OK");
    } else {
        tracing::error!(workspace = %config.workspace.display(), "Workspace: missing");
    }
    Ok(CheckResult {
        state,
        workspace,
        instances: plan.instances.len(),
    })
}

/// Runs pipelines under one cancellation controller.
pub struct Orchestrator {
    controller: Arc<CancellationController>,
    provisioner: Option<Arc<dyn Provisioner>>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(state: Arc<dyn StateBackend>) -> Self {
        Self::with_controller(Arc::new(CancellationController::new(state)))
    }

    #[must_use]
    pub fn with_controller(controller: Arc<CancellationController>) -> Self {
        Self {
            controller,
            provisioner: None,
        }
    }

    /// Replace the default [`DirectoryProvisioner`].
    #[must_use]
    pub fn with_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    #[must_use]
    pub fn controller(&self) -> &Arc<CancellationController> {
        &self.controller
    }

    /// Run a pipeline for one trigger.
    ///
    /// Earlier active runs of the same pipeline and ref are cancelled first,
    /// unless the ref is protected. Instance failures are reported in the
    /// returned outcome, not as errors.
    ///
    /// # Errors
    ///
    /// Returns an error if the pipeline is invalid or the run cannot be
    /// set up or recorded.
    pub async fn run(&self, config: &PipelineConfig, trigger: &TriggerEvent) -> Result<RunOutcome> {
        let plan = plan(config)?;
        let pipeline = PipelineId::new(config.pipeline.as_str());
        let mut trigger = trigger.clone();
        if trigger.git_ref.as_str() == config.protected_branch {
            trigger.is_protected = true;
        }

        let ticket = self
            .controller
            .on_trigger(&pipeline, &trigger)
            .context("Failed to register run")?;
        let run_id = ticket.run_id;

        let result = self.execute(config, plan, &trigger, &ticket).await;
        self.controller.complete(run_id);
        match result {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                let message = format!("{e:#}");
                if let Err(state_err) =
                    self.controller
                        .state()
                        .finish_run(run_id, RunStatus::Failed, Some(&message))
                {
                    tracing::error!(run_id, error = %state_err, "Failed to record run failure");
                }
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        config: &PipelineConfig,
        plan: RunPlan,
        trigger: &TriggerEvent,
        ticket: &RunTicket,
    ) -> Result<RunOutcome> {
        let started = Instant::now();
        let started_at = chrono::Utc::now();
        let run_id = ticket.run_id;
        let state = Arc::clone(self.controller.state());

        let output_dir = &config.output.dir;
        let run_dir = output_dir.join("runs").join(format!(
            "{run_id}-{}",
            started_at.format(RUN_DIR_TIME_FMT)
        ));
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create run directory {}", run_dir.display()))?;
        let workspace = std::fs::canonicalize(&config.workspace).with_context(|| {
            format!("Workspace {} is not accessible", config.workspace.display())
        })?;

        let provisioner = self.provisioner.clone().unwrap_or_else(|| {
            Arc::new(DirectoryProvisioner::new(config.toolchain_root.clone())) as Arc<dyn Provisioner>
        });
        let cache = SharedCache::for_root(output_dir.join("cache"));
        let shared_config = Arc::new(config.clone());
        let graph = Arc::new(plan.graph);

        let run_vars = Vars::new()
            .with("run.id", run_id.to_string())
            .with("git.ref", trigger.git_ref.as_str())
            .with("git.commit", trigger.commit.as_str());

        let instance_count = plan.instances.len();
        let parallelism = config
            .matrix
            .as_ref()
            .and_then(|m| m.max_parallel)
            .unwrap_or(instance_count)
            .max(1);
        tracing::info!(
            run_id,
            pipeline = %config.pipeline,
            git_ref = %trigger.git_ref,
            commit = %trigger.commit,
            instances = instance_count,
            parallelism,
            dir = %run_dir.display(),
            "Starting run"
        );

        let semaphore = Arc::new(Semaphore::new(parallelism));
        let mut join_set: JoinSet<Result<InstanceOutcome>> = JoinSet::new();
        let mut labels = Vec::with_capacity(instance_count);

        for spec in plan.instances {
            let slug = spec.slug();
            labels.push((spec.index, spec.label(), run_dir.join(&slug)));
            let instance_plan = InstancePlan {
                config: Arc::clone(&shared_config),
                graph: Arc::clone(&graph),
                layout: InstanceLayout::new(
                    run_dir.join(&slug),
                    output_dir.join("state").join(&config.pipeline).join(&slug),
                ),
                spec,
                workspace: workspace.clone(),
                run_vars: run_vars.clone(),
                token: ticket.token.clone(),
                cache: Arc::clone(&cache),
                provisioner: Arc::clone(&provisioner),
            };
            let semaphore = Arc::clone(&semaphore);
            let state = Arc::clone(&state);
            join_set.spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| anyhow::anyhow!("Semaphore closed: {e}"))?;
                record(state.as_ref(), &InstanceRecord {
                    run_id,
                    instance: instance_plan.spec.label(),
                    status: RunStatus::Running,
                    error_kind: None,
                    error_message: None,
                    failing_suites: Vec::new(),
                    line_rate: None,
                });
                Ok(run_instance(instance_plan).await)
            });
        }

        let mut outcomes = Vec::with_capacity(instance_count);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Ok(outcome)) => outcomes.push(outcome),
                Ok(Err(e)) => tracing::error!(run_id, "Instance task failed: {e:#}"),
                Err(join_err) => tracing::error!(run_id, "Instance task panicked: {join_err}"),
            }
        }
        // Instances lost to a panic still count, as failures.
        for (index, label, dir) in labels {
            if !outcomes.iter().any(|o| o.index == index) {
                outcomes.push(lost_instance(index, label, dir));
            }
        }
        outcomes.sort_by_key(|o| o.index);

        for outcome in &outcomes {
            record(state.as_ref(), &InstanceRecord {
                run_id,
                instance: outcome.label.clone(),
                status: outcome.status,
                error_kind: outcome.error_kind.clone(),
                error_message: outcome.error.clone(),
                failing_suites: outcome.failing_suites.clone(),
                line_rate: outcome.coverage.as_ref().map(|c| c.line_rate),
            });
        }

        let mut status = outcomes
            .iter()
            .fold(RunStatus::Succeeded, |acc, o| acc.worst(o.status));
        if ticket.token.is_cancelled() {
            status = RunStatus::Cancelled;
        }
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| o.status == RunStatus::Failed)
            .map(|o| o.label.as_str())
            .collect();
        let message = (!failed.is_empty()).then(|| format!("failed instances: {}", failed.join(", ")));

        let applied = state
            .finish_run(run_id, status, message.as_deref())
            .context("Failed to finish run")?;
        if !applied {
            // Already finalized elsewhere, e.g. superseded by another process.
            if let Some(record) = state.get_run(run_id)? {
                status = record.status;
            }
        }

        let outcome = RunOutcome {
            run_id,
            pipeline: config.pipeline.clone(),
            git_ref: trigger.git_ref.to_string(),
            commit: trigger.commit.clone(),
            status,
            dir: run_dir.clone(),
            started_at: started_at.to_rfc3339(),
            duration_secs: started.elapsed().as_secs_f64(),
            instances: outcomes,
        };
        let json = serde_json::to_vec_pretty(&outcome)?;
        std::fs::write(run_dir.join("run.json"), json)
            .with_context(|| format!("Failed to write run.json in {}", run_dir.display()))?;

        tracing::info!(
            run_id,
            pipeline = %config.pipeline,
            status = %status,
            duration_secs = outcome.duration_secs,
            "Run finished"
        );
        Ok(outcome)
    }

    /// Cancel every run this process owns.
    pub fn cancel_all(&self) {
        self.controller.cancel_all();
    }

    /// Cancel the runs of this process that another process has marked
    /// cancelled. Returns how many were cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store fails.
    pub fn cancel_marked(&self) -> Result<usize> {
        Ok(self.controller.cancel_marked()?)
    }

    /// Cancel one run by id. No-op for terminal or unknown runs.
    ///
    /// # Errors
    ///
    /// Returns an error if the state store fails.
    pub fn cancel(&self, run_id: RunId) -> Result<bool> {
        Ok(self.controller.cancel_run(run_id, "cancelled by request")?)
    }
}

fn record(state: &dyn StateBackend, instance: &InstanceRecord) {
    if let Err(e) = state.record_instance(instance) {
        tracing::warn!(
            run_id = instance.run_id,
            instance = %instance.instance,
            error = %e,
            "Failed to record instance"
        );
    }
}

fn lost_instance(index: usize, label: String, dir: PathBuf) -> InstanceOutcome {
    InstanceOutcome {
        index,
        label,
        values: Default::default(),
        status: RunStatus::Failed,
        error_kind: Some("infrastructure".to_string()),
        error: Some("instance task panicked".to_string()),
        failing_suites: Vec::new(),
        stages: Vec::new(),
        coverage: None,
        duration_secs: 0.0,
        dir,
    }
}
