//! Pipeline YAML configuration types.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 3_600;
const DEFAULT_KILL_GRACE_SECS: u64 = 5;

fn default_protected_branch() -> String {
    "main".to_string()
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from(".gantry")
}

fn default_stage_timeout() -> u64 {
    DEFAULT_STAGE_TIMEOUT_SECS
}

fn default_kill_grace() -> u64 {
    DEFAULT_KILL_GRACE_SECS
}

fn default_one() -> u32 {
    1
}

fn default_backoff_ms() -> u64 {
    1_000
}

/// Top-level pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub version: String,
    pub pipeline: String,
    /// Ref whose runs are never preempted by later triggers.
    #[serde(default = "default_protected_branch")]
    pub protected_branch: String,
    /// `None` means a single instance with no axis values.
    #[serde(default)]
    pub matrix: Option<MatrixConfig>,
    /// Directory commands run in (the checkout under test).
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,
    /// Root of `<family>/<version>/bin` toolchain installs.
    #[serde(default)]
    pub toolchain_root: Option<PathBuf>,
    #[serde(default)]
    pub defaults: StageDefaults,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub output: OutputConfig,
    pub stages: Vec<StageConfig>,
}

/// Matrix axes and scheduling bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatrixConfig {
    pub axes: Vec<AxisConfig>,
    /// Each entry drops combinations matching all of its axis values.
    #[serde(default)]
    pub exclude: Vec<BTreeMap<String, String>>,
    /// Upper bound on concurrently running instances.
    #[serde(default)]
    pub max_parallel: Option<usize>,
}

/// One matrix axis. Values are strings; quote numeric versions (`"3.10"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    pub name: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefaults {
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_seconds: u64,
    /// Time between SIGTERM and SIGKILL when a process group is torn down.
    #[serde(default = "default_kill_grace")]
    pub kill_grace_seconds: u64,
}

impl Default for StageDefaults {
    fn default() -> Self {
        Self {
            stage_timeout_seconds: DEFAULT_STAGE_TIMEOUT_SECS,
            kill_grace_seconds: DEFAULT_KILL_GRACE_SECS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateBackendKind {
    #[default]
    Sqlite,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    #[serde(default)]
    pub backend: StateBackendKind,
    /// Database path; defaults to `<output.dir>/state.db`.
    #[serde(default)]
    pub connection: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    /// Keep each instance's scratch `work/` directory after completion.
    #[serde(default)]
    pub keep_workdirs: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            keep_workdirs: false,
        }
    }
}

/// A command either as a shell line (run via `sh -c`) or a fixed argv.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandLine {
    Shell(String),
    Argv(Vec<String>),
}

impl CommandLine {
    /// Every string that may carry `{{ ... }}` placeholders.
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Self::Shell(line) => vec![line.as_str()],
            Self::Argv(argv) => argv.iter().map(String::as_str).collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Shell(line) => line.trim().is_empty(),
            Self::Argv(argv) => argv.first().map_or(true, |p| p.trim().is_empty()),
        }
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Shell(line) => f.write_str(line),
            Self::Argv(argv) => f.write_str(&argv.join(" ")),
        }
    }
}

/// One stage of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageConfig {
    pub name: String,
    /// Predecessors. `None` means "the previous stage"; `[]` makes a root.
    #[serde(default)]
    pub needs: Option<Vec<String>>,
    /// Best-effort stages run even after upstream failure and never change
    /// the instance verdict. Defaults to `true` for report stages.
    #[serde(default)]
    pub best_effort: Option<bool>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(flatten)]
    pub action: StageAction,
}

impl StageConfig {
    #[must_use]
    pub fn is_best_effort(&self) -> bool {
        self.best_effort
            .unwrap_or(matches!(self.action, StageAction::Report(_)))
    }
}

/// What a stage does. The YAML key selects the variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    Toolchain(ToolchainStage),
    Install(InstallStage),
    Compile(CompileStage),
    External(ExternalStage),
    Test(TestStage),
    Report(ReportStage),
    Run(RunStage),
}

impl StageAction {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Toolchain(_) => "toolchain",
            Self::Install(_) => "install",
            Self::Compile(_) => "compile",
            Self::External(_) => "external",
            Self::Test(_) => "test",
            Self::Report(_) => "report",
            Self::Run(_) => "run",
        }
    }

    /// Every string field that is rendered with placeholders at run time.
    pub fn templates(&self) -> Vec<&str> {
        let mut out = Vec::new();
        match self {
            Self::Toolchain(t) => {
                out.push(t.family.as_str());
                out.push(t.version.as_str());
                out.extend(t.bin_dir.iter().filter_map(|p| p.to_str()));
            }
            Self::Install(i) => {
                out.extend(i.manifest.to_str());
                out.extend(i.command.templates());
                if let Some(p) = &i.prefetch {
                    out.extend(p.templates());
                }
            }
            Self::Compile(c) => {
                out.extend(c.sources.iter().filter_map(|p| p.to_str()));
                out.extend(c.out_dir.to_str());
                out.extend(c.outputs.iter().filter_map(|p| p.to_str()));
                out.extend(c.command.templates());
            }
            Self::External(e) => {
                out.push(e.repository.as_str());
                out.push(e.revision.as_str());
                out.extend(e.path.to_str());
                if let Some(c) = &e.clone {
                    out.extend(c.templates());
                }
                if let Some(i) = &e.install {
                    out.extend(i.templates());
                }
                out.extend(e.build.templates());
            }
            Self::Test(t) => {
                for suite in &t.suites {
                    out.extend(suite.command.templates());
                    out.extend(suite.env.values().map(String::as_str));
                }
            }
            Self::Report(r) => match &r.reporter {
                ReporterConfig::Command { command } => out.extend(command.templates()),
                ReporterConfig::File { dir } => out.extend(dir.to_str()),
                ReporterConfig::None => {}
            },
            Self::Run(r) => {
                out.extend(r.command.templates());
                out.extend(r.env.values().map(String::as_str));
            }
        }
        out
    }
}

/// Select a toolchain `{family, version}` for the instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainStage {
    pub family: String,
    pub version: String,
    /// Explicit binary directory instead of `<toolchain_root>/<family>/<version>/bin`.
    #[serde(default)]
    pub bin_dir: Option<PathBuf>,
}

/// Install declared dependencies from a manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallStage {
    pub manifest: PathBuf,
    pub command: CommandLine,
    /// Populates the shared download cache once per manifest digest.
    #[serde(default)]
    pub prefetch: Option<CommandLine>,
}

/// Generate sources from schema files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileStage {
    pub sources: Vec<PathBuf>,
    pub out_dir: PathBuf,
    /// Run once per source with `{{ source }}` and `{{ out_dir }}` bound.
    pub command: CommandLine,
    /// Files that must exist afterwards.
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
}

/// Clone and build a third-party component and expose its binaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalStage {
    pub repository: String,
    pub revision: String,
    /// Clone destination, relative to the instance work directory.
    pub path: PathBuf,
    /// Replaces the default `git clone` + `git checkout` sequence.
    #[serde(default)]
    pub clone: Option<CommandLine>,
    #[serde(default)]
    pub install: Option<CommandLine>,
    pub build: CommandLine,
    /// Directories inside the clone prepended to `PATH`.
    #[serde(default)]
    pub bin_dirs: Vec<PathBuf>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoverageMode {
    #[default]
    Off,
    /// Every invocation keeps its own artifact file.
    Isolated,
    /// Per-invocation files are folded into the instance report and removed.
    Combined,
}

/// Execute test suites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestStage {
    pub suites: Vec<SuiteConfig>,
    #[serde(default)]
    pub coverage: CoverageMode,
    #[serde(default)]
    pub parallel: bool,
    /// Stop after the first failing suite. Off by default so one flaky
    /// suite cannot hide failures in the others.
    #[serde(default)]
    pub fail_fast: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    pub name: String,
    pub command: CommandLine,
    /// Times the suite is run.
    #[serde(default = "default_one")]
    pub attempts: u32,
    /// Failed attempts tolerated before the suite counts as failing.
    #[serde(default)]
    pub allowed_failures: u32,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Aggregate coverage and hand the report to a reporter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportStage {
    #[serde(default)]
    pub reporter: ReporterConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReporterConfig {
    /// Only write the combined report into the instance directory.
    #[default]
    None,
    /// Copy the report into `dir`.
    File { dir: PathBuf },
    /// Run a command with `{{ report }}` bound to the report path.
    Command { command: CommandLine },
}

/// Run an arbitrary command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStage {
    pub command: CommandLine,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}
