use std::path::Path;

use crate::config::types::ExternalStage;
use crate::config::validator::work_relative_path_problem;
use crate::context::ContextDelta;
use crate::errors::{compute_backoff, ExternalStep, StageError};
use crate::process::CommandSpec;
use crate::template::Vars;

use super::{StageEnv, StageOutput, StageRun};

/// Clone, build and expose an external component, retrying whole attempts
/// from a clean clone path up to `retries` times.
pub(super) async fn run(stage: &ExternalStage, env: &StageEnv) -> StageRun {
    let max_retries = stage.retries;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let result = build_once(stage, env).await;

        match result {
            Ok(delta) => {
                return StageRun {
                    output: StageOutput {
                        delta,
                        attempts: attempt,
                        ..StageOutput::default()
                    },
                    error: None,
                }
            }
            Err(ref err) if err.is_retryable() && attempt <= max_retries => {
                let delay = compute_backoff(stage.backoff_ms, attempt);
                #[allow(clippy::cast_possible_truncation)]
                let delay_ms = delay.as_millis() as u64;
                tracing::warn!(
                    instance = %env.instance,
                    stage = %env.stage,
                    attempt,
                    max_retries,
                    delay_ms,
                    error = %err,
                    "External build failed, will retry"
                );
                env.note(&format!("attempt {attempt} failed: {err}; retrying in {delay_ms}ms"));
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = env.supervision.token.cancelled() => {
                        return failed(StageError::Cancelled, attempt);
                    }
                }
            }
            Err(err) => {
                if err.is_retryable() && max_retries > 0 {
                    tracing::error!(
                        instance = %env.instance,
                        stage = %env.stage,
                        attempt,
                        max_retries,
                        error = %err,
                        "Max retries exhausted, failing external build"
                    );
                }
                return failed(err, attempt);
            }
        }
    }
}

fn failed(error: StageError, attempts: u32) -> StageRun {
    StageRun {
        output: StageOutput {
            attempts,
            ..StageOutput::default()
        },
        error: Some(error),
    }
}

fn step_error(step: ExternalStep) -> impl FnOnce(String) -> StageError {
    move |message| StageError::ExternalBuild { step, message }
}

async fn build_once(stage: &ExternalStage, env: &StageEnv) -> Result<ContextDelta, StageError> {
    let base = &env.ctx.vars;
    let work = &env.ctx.layout.work;
    let relative = env.render_path(base, &stage.path)?;
    if let Some(problem) = work_relative_path_problem(&relative) {
        return Err(StageError::ExternalBuild {
            step: ExternalStep::Clone,
            message: format!("clone path '{}' {problem}", relative.display()),
        });
    }
    let clone_dir = work.join(relative);
    let repository = env.render(base, &stage.repository)?;
    let revision = env.render(base, &stage.revision)?;
    let vars = base
        .with("repository", repository.as_str())
        .with("revision", revision.as_str())
        .with("path", clone_dir.to_string_lossy());

    prepare_clean_path(&clone_dir)?;
    clone(stage, env, &vars, &clone_dir, &repository, &revision).await?;

    if let Some(install) = &stage.install {
        let command = env.command(&vars, install)?;
        env.exec_ok(&command, &clone_dir, &[], step_error(ExternalStep::Install))
            .await?;
    }

    let build = env.command(&vars, &stage.build)?;
    env.exec_ok(&build, &clone_dir, &[], step_error(ExternalStep::Build))
        .await?;

    let mut exposed = Vec::with_capacity(stage.bin_dirs.len());
    for dir in &stage.bin_dirs {
        let bin = clone_dir.join(env.render_path(&vars, dir)?);
        if !bin.is_dir() {
            return Err(StageError::ExternalBuild {
                step: ExternalStep::Expose,
                message: format!("binary directory {} does not exist", bin.display()),
            });
        }
        exposed.push(bin);
    }

    tracing::info!(
        instance = %env.instance,
        stage = %env.stage,
        repository = %repository,
        revision = %revision,
        exposed = exposed.len(),
        "Built external component"
    );
    // First declared directory ends up first on PATH.
    exposed.reverse();
    Ok(ContextDelta {
        path_prepend: exposed,
        ..ContextDelta::default()
    })
}

fn prepare_clean_path(clone_dir: &Path) -> Result<(), StageError> {
    if clone_dir.exists() {
        std::fs::remove_dir_all(clone_dir)?;
    }
    if let Some(parent) = clone_dir.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(())
}

async fn clone(
    stage: &ExternalStage,
    env: &StageEnv,
    vars: &Vars,
    clone_dir: &Path,
    repository: &str,
    revision: &str,
) -> Result<(), StageError> {
    let work = &env.ctx.layout.work;
    if let Some(custom) = &stage.clone {
        let command = env.command(vars, custom)?;
        return env
            .exec_ok(&command, work, &[], step_error(ExternalStep::Clone))
            .await;
    }

    let dest = clone_dir.to_string_lossy().into_owned();
    let clone = CommandSpec::new("git", ["clone", "--quiet", repository, dest.as_str()]);
    env.exec_ok(&clone, work, &[], step_error(ExternalStep::Clone))
        .await?;
    let checkout = CommandSpec::new("git", ["checkout", "--quiet", revision]);
    env.exec_ok(&checkout, clone_dir, &[], step_error(ExternalStep::Checkout))
        .await
}
