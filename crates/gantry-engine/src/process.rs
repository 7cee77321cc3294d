//! Process supervision: one process group per command, output to a log
//! file, torn down as a group on timeout or cancellation.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::types::CommandLine;
use crate::context::ExecutionContext;
use crate::template::{UnknownPlaceholder, Vars};

/// Exit code reported when the program cannot be found, as a shell would.
pub const EXIT_NOT_FOUND: i32 = 127;

/// A fully rendered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    /// Render placeholders. Shell lines run through `sh -c`.
    ///
    /// # Errors
    ///
    /// Returns the first placeholder without a binding.
    pub fn render(line: &CommandLine, vars: &Vars) -> Result<Self, UnknownPlaceholder> {
        match line {
            CommandLine::Shell(script) => Ok(Self {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), vars.render(script)?],
            }),
            CommandLine::Argv(argv) => {
                let mut rendered = argv
                    .iter()
                    .map(|a| vars.render(a))
                    .collect::<Result<Vec<_>, _>>()?
                    .into_iter();
                let program = rendered.next().unwrap_or_default();
                Ok(Self {
                    program,
                    args: rendered.collect(),
                })
            }
        }
    }

    #[must_use]
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Limits shared by every command of one stage.
#[derive(Debug, Clone)]
pub struct Supervision {
    /// Wall-clock budget of the whole stage.
    pub timeout: Duration,
    pub deadline: Instant,
    /// Time between SIGTERM and SIGKILL.
    pub grace: Duration,
    pub token: CancellationToken,
}

impl Supervision {
    #[must_use]
    pub fn new(timeout: Duration, grace: Duration, token: CancellationToken) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
            grace,
            token,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("timed out after {}s", .0.as_secs())]
    TimedOut(Duration),
    #[error("cancelled")]
    Cancelled,
    #[error("process I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// One command invocation inside an execution context.
#[derive(Debug)]
pub struct Invocation<'a> {
    pub command: &'a CommandSpec,
    pub cwd: &'a Path,
    pub ctx: &'a ExecutionContext,
    pub env: &'a [(String, String)],
    pub log: &'a Path,
}

/// Run a command to completion and return its exit code.
///
/// A signal-terminated process reports `128 + signal`. A program that does
/// not exist reports [`EXIT_NOT_FOUND`].
///
/// # Errors
///
/// Returns [`ProcessError::TimedOut`] or [`ProcessError::Cancelled`] after
/// the process group has been torn down, or an I/O error if the log file
/// or working directory is unusable.
pub async fn run(inv: &Invocation<'_>, sup: &Supervision) -> Result<i32, ProcessError> {
    if sup.token.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }
    if !inv.cwd.is_dir() {
        return Err(ProcessError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("working directory {} does not exist", inv.cwd.display()),
        )));
    }

    let mut log = OpenOptions::new().create(true).append(true).open(inv.log)?;
    writeln!(log, "$ {}", inv.command)?;

    let mut cmd = Command::new(&inv.command.program);
    cmd.args(&inv.command.args)
        .current_dir(inv.cwd)
        .env("PATH", inv.ctx.search_path())
        .envs(&inv.ctx.env)
        .envs(inv.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::null())
        .stdout(Stdio::from(log.try_clone()?))
        .stderr(Stdio::from(log.try_clone()?))
        .process_group(0)
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            writeln!(log, "gantry: {}: command not found", inv.command.program)?;
            return Ok(EXIT_NOT_FOUND);
        }
        Err(e) => return Err(e.into()),
    };
    let pid = child.id();
    tracing::debug!(pid, command = %inv.command, "Spawned process group");

    let interrupted = tokio::select! {
        status = child.wait() => {
            let code = exit_code(status?);
            writeln!(log, "gantry: exit {code}")?;
            return Ok(code);
        }
        () = tokio::time::sleep_until(sup.deadline) => ProcessError::TimedOut(sup.timeout),
        () = sup.token.cancelled() => ProcessError::Cancelled,
    };

    terminate_group(&mut child, pid, sup.grace).await;
    let _ = writeln!(log, "gantry: {interrupted}");
    Err(interrupted)
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// Send `signal` to every process in group `pgid`.
///
/// Returns `false` if the group no longer exists.
pub fn signal_group(pgid: i32, signal: i32) -> bool {
    // SAFETY: kill(2) with a negative pid only signals the group.
    unsafe { libc::kill(-pgid, signal) == 0 }
}

/// SIGTERM the group, wait `grace`, then SIGKILL whatever is left.
async fn terminate_group(child: &mut Child, pid: Option<u32>, grace: Duration) {
    let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()) else {
        let _ = child.start_kill();
        let _ = child.wait().await;
        return;
    };
    signal_group(pgid, libc::SIGTERM);
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::debug!(pgid, "Process group ignored SIGTERM, sending SIGKILL");
    }
    // Stragglers in the group outlive the leader; kill them too.
    signal_group(pgid, libc::SIGKILL);
    let _ = child.wait().await;
}
