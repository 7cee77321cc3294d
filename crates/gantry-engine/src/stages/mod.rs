//! Stage actions. Each action runs inside a snapshot of its instance's
//! [`ExecutionContext`] and reports the changes it made as a
//! [`ContextDelta`].

mod command;
mod compile;
mod external;
mod install;
mod report;
mod test_runner;
mod toolchain;

use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use gantry_types::coverage::CoverageSummary;

use crate::cache::SharedCache;
use crate::config::types::{CommandLine, StageAction, StageConfig};
use crate::context::{ContextDelta, ExecutionContext, Provisioner};
use crate::coverage::ArtifactRef;
use crate::errors::StageError;
use crate::process::{self, CommandSpec, Invocation, ProcessError, Supervision};
use crate::result::SuiteResult;
use crate::template::Vars;

/// Everything a stage action may use.
#[derive(Clone)]
pub struct StageEnv {
    pub stage: String,
    pub instance: String,
    pub ctx: ExecutionContext,
    pub supervision: Supervision,
    pub log: PathBuf,
    pub cache: Arc<SharedCache>,
    pub provisioner: Arc<dyn Provisioner>,
    /// Instance-wide invocation counter for coverage attribution.
    pub invocations: Arc<AtomicUsize>,
    /// Coverage artifacts produced by earlier stages of this instance.
    pub artifacts: Vec<ArtifactRef>,
}

/// What a finished stage hands back to the instance runner.
#[derive(Debug, Default)]
pub struct StageOutput {
    pub delta: ContextDelta,
    pub artifacts: Vec<ArtifactRef>,
    /// Artifacts folded into a combined report by this stage.
    pub consumed: Vec<PathBuf>,
    pub suites: Vec<SuiteResult>,
    pub coverage: Option<CoverageSummary>,
    pub attempts: u32,
}

impl StageOutput {
    fn with_delta(delta: ContextDelta) -> Self {
        Self {
            delta,
            attempts: 1,
            ..Self::default()
        }
    }
}

/// A stage's output together with its error, if any.
///
/// Test stages fail while still producing suite results and artifacts.
#[derive(Debug)]
pub struct StageRun {
    pub output: StageOutput,
    pub error: Option<StageError>,
}

impl From<Result<StageOutput, StageError>> for StageRun {
    fn from(result: Result<StageOutput, StageError>) -> Self {
        match result {
            Ok(output) => Self {
                output,
                error: None,
            },
            Err(error) => Self {
                output: StageOutput {
                    attempts: 1,
                    ..StageOutput::default()
                },
                error: Some(error),
            },
        }
    }
}

/// Evaluate one stage action.
pub async fn execute(stage: &StageConfig, env: &StageEnv) -> StageRun {
    match &stage.action {
        StageAction::Toolchain(t) => toolchain::run(t, env).into(),
        StageAction::Install(i) => install::run(i, env).await.into(),
        StageAction::Compile(c) => compile::run(c, env).await.into(),
        StageAction::External(e) => external::run(e, env).await,
        StageAction::Test(t) => test_runner::run(t, env).await,
        StageAction::Report(r) => report::run(r, env).await.into(),
        StageAction::Run(r) => command::run(r, env).await.into(),
    }
}

impl StageEnv {
    /// Render a field with the context's placeholder bindings.
    pub(crate) fn render(&self, vars: &Vars, input: &str) -> Result<String, StageError> {
        vars.render(input)
            .map_err(|e| StageError::Infrastructure(anyhow::anyhow!("stage '{}': {e}", self.stage)))
    }

    pub(crate) fn render_path(&self, vars: &Vars, path: &Path) -> Result<PathBuf, StageError> {
        Ok(PathBuf::from(self.render(vars, &path.to_string_lossy())?))
    }

    pub(crate) fn command(&self, vars: &Vars, line: &CommandLine) -> Result<CommandSpec, StageError> {
        CommandSpec::render(line, vars)
            .map_err(|e| StageError::Infrastructure(anyhow::anyhow!("stage '{}': {e}", self.stage)))
    }

    /// Run a command and return its exit code.
    pub(crate) async fn exec(
        &self,
        command: &CommandSpec,
        cwd: &Path,
        env: &[(String, String)],
    ) -> Result<i32, StageError> {
        let invocation = Invocation {
            command,
            cwd,
            ctx: &self.ctx,
            env,
            log: &self.log,
        };
        process::run(&invocation, &self.supervision)
            .await
            .map_err(|e| match e {
                ProcessError::TimedOut(after) => StageError::Timeout {
                    stage: self.stage.clone(),
                    after,
                },
                ProcessError::Cancelled => StageError::Cancelled,
                ProcessError::Io(io) => StageError::Infrastructure(
                    anyhow::Error::new(io).context(format!("stage '{}': {command}", self.stage)),
                ),
            })
    }

    /// Run a command; a non-zero exit becomes `on_failure(message)`.
    pub(crate) async fn exec_ok(
        &self,
        command: &CommandSpec,
        cwd: &Path,
        env: &[(String, String)],
        on_failure: impl FnOnce(String) -> StageError,
    ) -> Result<(), StageError> {
        match self.exec(command, cwd, env).await? {
            0 => Ok(()),
            code => Err(on_failure(format!(
                "`{command}` exited with code {code} (log: {})",
                self.log.display()
            ))),
        }
    }

    /// Append a line to the stage log.
    pub(crate) fn note(&self, line: &str) {
        use std::io::Write;
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log)
            .and_then(|mut f| writeln!(f, "gantry: {line}"));
        if let Err(e) = written {
            tracing::debug!(log = %self.log.display(), error = %e, "Failed to write stage log");
        }
    }
}
