//! Per-instance execution context and toolchain provisioning.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::errors::StageError;
use crate::template::Vars;

/// Directory layout of one instance inside a run directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceLayout {
    pub root: PathBuf,
    pub logs: PathBuf,
    pub coverage: PathBuf,
    /// Scratch space: external clones and other per-instance checkouts.
    pub work: PathBuf,
    /// Install stamps. Lives outside the run directory so it persists
    /// across runs of the same matrix combination.
    pub state: PathBuf,
}

impl InstanceLayout {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, state: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            logs: root.join("logs"),
            coverage: root.join("coverage"),
            work: root.join("work"),
            state: state.into(),
            root,
        }
    }

    /// # Errors
    ///
    /// Returns an I/O error if any directory cannot be created.
    pub fn create(&self) -> std::io::Result<()> {
        for dir in [&self.logs, &self.coverage, &self.work, &self.state] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn results_file(&self) -> PathBuf {
        self.root.join("results.json")
    }

    #[must_use]
    pub fn combined_report(&self) -> PathBuf {
        self.root.join("combined-coverage.json")
    }

    /// Log file for a stage. Characters unsafe in file names become `_`.
    #[must_use]
    pub fn stage_log(&self, stage: &str) -> PathBuf {
        let stem: String = stage
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.logs.join(format!("{stem}.log"))
    }
}

/// A provisioned toolchain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub family: String,
    pub version: String,
    pub bin_dir: PathBuf,
}

/// Changes a stage makes to its instance's context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextDelta {
    pub toolchain: Option<Toolchain>,
    pub path_prepend: Vec<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl ContextDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.toolchain.is_none() && self.path_prepend.is_empty() && self.env.is_empty()
    }
}

/// Isolated environment for one pipeline instance.
///
/// Stages receive a snapshot; only the instance runner applies deltas, so
/// siblings never observe each other's state.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workspace: PathBuf,
    pub layout: InstanceLayout,
    /// Toolchains by family. Provisioning a family again replaces it.
    pub toolchains: BTreeMap<String, Toolchain>,
    /// Directories ahead of the inherited `PATH`, highest priority first.
    pub path_entries: Vec<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub vars: Vars,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(workspace: PathBuf, layout: InstanceLayout, vars: Vars) -> Self {
        Self {
            workspace,
            layout,
            toolchains: BTreeMap::new(),
            path_entries: Vec::new(),
            env: BTreeMap::new(),
            vars,
        }
    }

    pub fn apply(&mut self, delta: ContextDelta) {
        if let Some(toolchain) = delta.toolchain {
            if let Some(previous) = self.toolchains.remove(&toolchain.family) {
                self.path_entries.retain(|p| p != &previous.bin_dir);
            }
            self.prepend_path(toolchain.bin_dir.clone());
            self.toolchains.insert(toolchain.family.clone(), toolchain);
        }
        // Later entries in the delta end up in front.
        for dir in delta.path_prepend {
            self.prepend_path(dir);
        }
        self.env.extend(delta.env);
    }

    fn prepend_path(&mut self, dir: PathBuf) {
        self.path_entries.retain(|p| p != &dir);
        self.path_entries.insert(0, dir);
    }

    /// `PATH` for child processes: context entries, then the inherited value.
    #[must_use]
    pub fn search_path(&self) -> OsString {
        let inherited = std::env::var_os("PATH").unwrap_or_default();
        let mut entries: Vec<PathBuf> = self.path_entries.clone();
        entries.extend(std::env::split_paths(&inherited));
        std::env::join_paths(entries).unwrap_or(inherited)
    }

    /// Stable description of the provisioned toolchain set.
    #[must_use]
    pub fn toolchain_fingerprint(&self) -> String {
        self.toolchains
            .values()
            .map(|t| format!("{}={}@{}", t.family, t.version, t.bin_dir.display()))
            .collect::<Vec<_>>()
            .join(";")
    }

    /// Resolve a workspace-relative path.
    #[must_use]
    pub fn workspace_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }
}

/// What a toolchain stage asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolchainRequest {
    pub family: String,
    pub version: String,
    /// Explicit binary directory, already resolved against the workspace.
    pub bin_dir: Option<PathBuf>,
}

/// Turns a `{family, version}` request into binaries on `PATH`.
pub trait Provisioner: Send + Sync {
    /// # Errors
    ///
    /// Returns [`StageError::Provision`] when the version is unavailable. No
    /// fallback version is ever substituted.
    fn provision(&self, request: &ToolchainRequest) -> Result<Toolchain, StageError>;
}

/// Resolves pre-installed toolchains under `<root>/<family>/<version>/bin`.
#[derive(Debug, Clone, Default)]
pub struct DirectoryProvisioner {
    root: Option<PathBuf>,
}

impl DirectoryProvisioner {
    #[must_use]
    pub fn new(root: Option<PathBuf>) -> Self {
        Self { root }
    }
}

impl Provisioner for DirectoryProvisioner {
    fn provision(&self, request: &ToolchainRequest) -> Result<Toolchain, StageError> {
        let unavailable = |reason: String| StageError::Provision {
            family: request.family.clone(),
            version: request.version.clone(),
            reason,
        };
        let bin_dir = match (&request.bin_dir, &self.root) {
            (Some(dir), _) => dir.clone(),
            (None, Some(root)) => root
                .join(&request.family)
                .join(&request.version)
                .join("bin"),
            (None, None) => {
                return Err(unavailable("no toolchain root configured".to_string()));
            }
        };
        if !bin_dir.is_dir() {
            return Err(unavailable(format!(
                "{} is not a directory",
                bin_dir.display()
            )));
        }
        Ok(Toolchain {
            family: request.family.clone(),
            version: request.version.clone(),
            bin_dir,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(root: &Path) -> ExecutionContext {
        ExecutionContext::new(
            root.to_path_buf(),
            InstanceLayout::new(root.join("inst"), root.join("state")),
            Vars::new(),
        )
    }

    fn toolchain(family: &str, version: &str) -> Toolchain {
        Toolchain {
            family: family.into(),
            version: version.into(),
            bin_dir: PathBuf::from(format!("/tc/{family}/{version}/bin")),
        }
    }

    #[test]
    fn two_families_coexist_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path());
        c.apply(ContextDelta {
            toolchain: Some(toolchain("python", "3.8")),
            ..Default::default()
        });
        c.apply(ContextDelta {
            toolchain: Some(toolchain("node", "14")),
            ..Default::default()
        });
        assert_eq!(c.toolchains.len(), 2);
        assert_eq!(
            c.path_entries,
            vec![
                PathBuf::from("/tc/node/14/bin"),
                PathBuf::from("/tc/python/3.8/bin")
            ]
        );
        assert_eq!(
            c.toolchain_fingerprint(),
            "node=14@/tc/node/14/bin;python=3.8@/tc/python/3.8/bin"
        );
    }

    #[test]
    fn same_family_replaces_previous_version() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path());
        for version in ["3.7", "3.8"] {
            c.apply(ContextDelta {
                toolchain: Some(toolchain("python", version)),
                ..Default::default()
            });
        }
        assert_eq!(c.path_entries, vec![PathBuf::from("/tc/python/3.8/bin")]);
    }

    #[test]
    fn search_path_puts_context_first() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = ctx(dir.path());
        c.apply(ContextDelta {
            path_prepend: vec![PathBuf::from("/opt/sim/bin")],
            ..Default::default()
        });
        let path = c.search_path();
        let first = std::env::split_paths(&path).next().unwrap();
        assert_eq!(first, PathBuf::from("/opt/sim/bin"));
    }

    #[test]
    fn directory_provisioner_resolves_root_layout() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("python").join("3.8").join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let provisioner = DirectoryProvisioner::new(Some(dir.path().to_path_buf()));

        let ok = provisioner
            .provision(&ToolchainRequest {
                family: "python".into(),
                version: "3.8".into(),
                bin_dir: None,
            })
            .unwrap();
        assert_eq!(ok.bin_dir, bin);

        let err = provisioner
            .provision(&ToolchainRequest {
                family: "python".into(),
                version: "3.9".into(),
                bin_dir: None,
            })
            .unwrap_err();
        assert_eq!(err.kind(), "provision");
    }

    #[test]
    fn explicit_bin_dir_wins_over_root() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = DirectoryProvisioner::new(None);
        let tc = provisioner
            .provision(&ToolchainRequest {
                family: "sh".into(),
                version: "system".into(),
                bin_dir: Some(dir.path().to_path_buf()),
            })
            .unwrap();
        assert_eq!(tc.bin_dir, dir.path());
    }

    #[test]
    fn layout_paths() {
        let layout = InstanceLayout::new("/runs/1/000-default", "/state/000-default");
        assert_eq!(
            layout.stage_log("tests"),
            PathBuf::from("/runs/1/000-default/logs/tests.log")
        );
        assert_eq!(
            layout.stage_log("unit tests/py"),
            PathBuf::from("/runs/1/000-default/logs/unit_tests_py.log")
        );
        assert_eq!(
            layout.results_file(),
            PathBuf::from("/runs/1/000-default/results.json")
        );
    }
}
