//! Suite execution with optional coverage capture.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use gantry_types::coverage::CoverageArtifact;
use tokio::task::JoinSet;

use crate::config::types::{CoverageMode, SuiteConfig, TestStage};
use crate::coverage::{self, ArtifactRef, COVERAGE_FILE_ENV};
use crate::errors::StageError;
use crate::process::CommandSpec;
use crate::result::SuiteResult;

use super::{StageEnv, StageOutput, StageRun};

struct SuiteRun {
    result: SuiteResult,
    artifacts: Vec<ArtifactRef>,
}

/// A suite stopped by cancellation, a timeout or a host error, with the
/// coverage its finished attempts produced.
struct SuiteInterrupted {
    error: StageError,
    artifacts: Vec<ArtifactRef>,
}

impl From<StageError> for SuiteInterrupted {
    fn from(error: StageError) -> Self {
        Self {
            error,
            artifacts: Vec::new(),
        }
    }
}

pub(super) async fn run(stage: &TestStage, env: &StageEnv) -> StageRun {
    // Reserve invocation indexes up front so attribution does not depend on
    // completion order.
    let total: usize = stage.suites.iter().map(|s| s.attempts as usize).sum();
    let mut next = env.invocations.fetch_add(total, Ordering::SeqCst);
    let mut plans = Vec::with_capacity(stage.suites.len());
    for suite in &stage.suites {
        plans.push((suite.clone(), next));
        next += suite.attempts as usize;
    }

    let runs = if stage.parallel {
        run_parallel(plans, stage.coverage, env).await
    } else {
        run_sequential(plans, stage.coverage, stage.fail_fast, env).await
    };

    let mut output = StageOutput {
        attempts: 1,
        ..StageOutput::default()
    };
    let mut interrupt: Option<StageError> = None;
    for run in runs {
        match run {
            Ok(run) => {
                output.artifacts.extend(run.artifacts);
                output.suites.push(run.result);
            }
            Err(SuiteInterrupted { error: err, artifacts }) => {
                output.artifacts.extend(artifacts);
                // Cancellation outranks a timeout or infrastructure error.
                let replace = match &interrupt {
                    None => true,
                    Some(StageError::Cancelled) => false,
                    Some(_) => matches!(err, StageError::Cancelled),
                };
                if replace {
                    interrupt = Some(err);
                }
            }
        }
    }

    let failing_suites: Vec<String> = output
        .suites
        .iter()
        .filter(|s| !s.passed)
        .map(|s| s.name.clone())
        .collect();
    let error = interrupt.or_else(|| {
        (!failing_suites.is_empty()).then(|| StageError::TestFailure {
            failing_suites: failing_suites.clone(),
        })
    });

    tracing::info!(
        instance = %env.instance,
        stage = %env.stage,
        suites = output.suites.len(),
        failing = failing_suites.len(),
        artifacts = output.artifacts.len(),
        "Test stage finished"
    );
    StageRun { output, error }
}

async fn run_sequential(
    plans: Vec<(SuiteConfig, usize)>,
    mode: CoverageMode,
    fail_fast: bool,
    env: &StageEnv,
) -> Vec<Result<SuiteRun, SuiteInterrupted>> {
    let total = plans.len();
    let mut runs = Vec::with_capacity(total);
    for (position, (suite, first_invocation)) in plans.into_iter().enumerate() {
        let run = run_suite(&suite, first_invocation, mode, env).await;
        let stop = match &run {
            Ok(r) => fail_fast && !r.result.passed,
            Err(_) => true,
        };
        runs.push(run);
        if stop {
            let skipped = total - position - 1;
            if skipped > 0 {
                env.note(&format!("skipping {skipped} remaining suite(s)"));
            }
            break;
        }
    }
    runs
}

async fn run_parallel(
    plans: Vec<(SuiteConfig, usize)>,
    mode: CoverageMode,
    env: &StageEnv,
) -> Vec<Result<SuiteRun, SuiteInterrupted>> {
    let mut join_set = JoinSet::new();
    let count = plans.len();
    for (position, (suite, first_invocation)) in plans.into_iter().enumerate() {
        // Separate logs keep concurrent output attributable.
        let mut suite_env = env.clone();
        suite_env.log = env
            .ctx
            .layout
            .stage_log(&format!("{}.{}", env.stage, suite.name));
        let suite_env = Arc::new(suite_env);
        join_set.spawn(async move {
            (
                position,
                run_suite(&suite, first_invocation, mode, &suite_env).await,
            )
        });
    }

    let mut slots: Vec<Option<Result<SuiteRun, SuiteInterrupted>>> = (0..count).map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((position, run)) => slots[position] = Some(run),
            Err(join_err) => {
                tracing::error!(stage = %env.stage, "Suite task panicked: {join_err}");
                let err = StageError::Infrastructure(anyhow::anyhow!(
                    "suite task panicked: {join_err}"
                ));
                if let Some(slot) = slots.iter_mut().find(|s| s.is_none()) {
                    *slot = Some(Err(err.into()));
                }
            }
        }
    }
    slots.into_iter().flatten().collect()
}

async fn run_suite(
    suite: &SuiteConfig,
    first_invocation: usize,
    mode: CoverageMode,
    env: &StageEnv,
) -> Result<SuiteRun, SuiteInterrupted> {
    let started = Instant::now();
    let vars = &env.ctx.vars;
    let command = env.command(vars, &suite.command)?;
    let mut base_env = Vec::with_capacity(suite.env.len() + 2);
    for (key, value) in &suite.env {
        base_env.push((key.clone(), env.render(vars, value)?));
    }
    base_env.push(("GANTRY_SUITE".to_string(), suite.name.clone()));

    let mut failures = 0u32;
    let mut artifacts = Vec::new();
    for attempt in 0..suite.attempts {
        let invocation = first_invocation + attempt as usize;
        match run_attempt(suite, &command, &base_env, invocation, mode, env).await {
            Ok((code, artifact)) => {
                if code != 0 {
                    failures += 1;
                    tracing::warn!(
                        instance = %env.instance,
                        suite = %suite.name,
                        attempt = attempt + 1,
                        attempts = suite.attempts,
                        code,
                        "Suite attempt failed"
                    );
                }
                artifacts.extend(artifact);
            }
            Err(error) => return Err(SuiteInterrupted { error, artifacts }),
        }
    }

    let passed = failures <= suite.allowed_failures;
    env.note(&format!(
        "suite {}: pass rate {}/{}",
        suite.name,
        suite.attempts - failures,
        suite.attempts
    ));
    Ok(SuiteRun {
        result: SuiteResult {
            name: suite.name.clone(),
            passed,
            attempts: suite.attempts,
            failures,
            artifacts: if mode == CoverageMode::Isolated {
                artifacts.iter().map(|a| a.path.clone()).collect()
            } else {
                Vec::new()
            },
            duration_secs: started.elapsed().as_secs_f64(),
        },
        artifacts,
    })
}

/// One invocation of a suite: its exit code and the coverage it wrote.
async fn run_attempt(
    suite: &SuiteConfig,
    command: &CommandSpec,
    base_env: &[(String, String)],
    invocation: usize,
    mode: CoverageMode,
    env: &StageEnv,
) -> Result<(i32, Option<ArtifactRef>), StageError> {
    let mut invocation_env = base_env.to_vec();
    invocation_env.push(("GANTRY_INVOCATION".to_string(), invocation.to_string()));

    let artifact_path = (mode != CoverageMode::Off).then(|| {
        env.ctx
            .layout
            .coverage
            .join(coverage::artifact_file_name(invocation, &suite.name))
    });
    if let Some(path) = &artifact_path {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        invocation_env.push((
            COVERAGE_FILE_ENV.to_string(),
            path.to_string_lossy().into_owned(),
        ));
    }

    let code = env.exec(command, &env.ctx.workspace, &invocation_env).await?;

    let Some(path) = artifact_path else {
        return Ok((code, None));
    };
    match coverage::read_raw(&path) {
        Ok(Some(data)) => {
            let artifact = CoverageArtifact {
                instance: env.instance.clone(),
                invocation,
                suite: suite.name.clone(),
                data,
            };
            coverage::write_artifact(&path, &artifact)?;
            Ok((
                code,
                Some(ArtifactRef {
                    path,
                    combined: mode == CoverageMode::Combined,
                }),
            ))
        }
        Ok(None) => {
            tracing::debug!(suite = %suite.name, invocation, "Suite wrote no coverage");
            Ok((code, None))
        }
        Err(e) => {
            tracing::warn!(suite = %suite.name, invocation, error = %e, "Ignoring unreadable coverage");
            Ok((code, None))
        }
    }
}
