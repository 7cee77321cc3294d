//! Semantic validation for parsed pipeline configuration values.

use std::collections::HashSet;
use std::path::{Component, Path};

use anyhow::{bail, Result};

use crate::config::types::{
    CommandLine, CoverageMode, PipelineConfig, ReporterConfig, StageAction, StageConfig,
};
use crate::dag::StageGraph;
use crate::matrix;
use crate::template;

/// Upper bound on external build retries.
pub const MAX_EXTERNAL_RETRIES: u32 = 10;

/// Upper bound on attempts of a single test suite.
pub const MAX_SUITE_ATTEMPTS: u32 = 10;

/// Placeholders bound for every stage of every instance.
const COMMON_PLACEHOLDERS: &[&str] = &[
    "instance.id",
    "instance.dir",
    "instance.work_dir",
    "run.id",
    "git.ref",
    "git.commit",
    "workspace",
];

/// Extra placeholders a stage kind binds while it runs.
fn stage_placeholders(action: &StageAction) -> &'static [&'static str] {
    match action {
        StageAction::Compile(_) => &["source", "out_dir"],
        StageAction::External(_) => &["repository", "revision", "path"],
        StageAction::Report(_) => &["report"],
        _ => &[],
    }
}

/// Placeholders that render to absolute paths.
const ABSOLUTE_PLACEHOLDERS: &[&str] = &["workspace", "instance.dir", "instance.work_dir"];

/// Why `path` cannot name a directory below the instance work directory,
/// if it cannot.
pub(crate) fn work_relative_path_problem(path: &Path) -> Option<&'static str> {
    if path.as_os_str().is_empty() {
        return Some("must not be empty");
    }
    let mut below = false;
    for component in path.components() {
        match component {
            Component::Normal(_) => below = true,
            Component::CurDir => {}
            Component::ParentDir => return Some("must not contain '..'"),
            Component::RootDir | Component::Prefix(_) => {
                return Some("must be relative to the instance work directory")
            }
        }
    }
    if below {
        None
    } else {
        Some("must name a directory below the instance work directory")
    }
}

fn check_command(command: &CommandLine, context: &str, errors: &mut Vec<String>) {
    if command.is_empty() {
        errors.push(format!("{context}: command must not be empty"));
    }
}

fn check_placeholders(stage: &StageConfig, axes: &HashSet<&str>, errors: &mut Vec<String>) {
    let extra = stage_placeholders(&stage.action);
    let mut reported = HashSet::new();
    for field in stage.action.templates() {
        for name in template::placeholders(field) {
            let known = match name.strip_prefix("matrix.") {
                Some(axis) => axes.contains(axis),
                None => COMMON_PLACEHOLDERS.contains(&name.as_str()) || extra.contains(&name.as_str()),
            };
            if !known && reported.insert(name.clone()) {
                errors.push(format!(
                    "Stage '{}': unknown placeholder '{{{{ {name} }}}}'",
                    stage.name
                ));
            }
        }
    }
}

fn check_action(config: &PipelineConfig, stage: &StageConfig, errors: &mut Vec<String>) {
    let ctx = format!("Stage '{}'", stage.name);
    match &stage.action {
        StageAction::Toolchain(t) => {
            if t.family.trim().is_empty() || t.version.trim().is_empty() {
                errors.push(format!("{ctx}: toolchain family and version must not be empty"));
            }
            if t.bin_dir.is_none() && config.toolchain_root.is_none() {
                errors.push(format!(
                    "{ctx}: toolchain needs either bin_dir or a pipeline toolchain_root"
                ));
            }
        }
        StageAction::Install(i) => {
            if i.manifest.as_os_str().is_empty() {
                errors.push(format!("{ctx}: install manifest must not be empty"));
            }
            check_command(&i.command, &ctx, errors);
            if let Some(prefetch) = &i.prefetch {
                check_command(prefetch, &format!("{ctx} prefetch"), errors);
            }
        }
        StageAction::Compile(c) => {
            if c.sources.is_empty() {
                errors.push(format!("{ctx}: compile needs at least one source"));
            }
            check_command(&c.command, &ctx, errors);
        }
        StageAction::External(e) => {
            if e.repository.trim().is_empty() {
                errors.push(format!("{ctx}: external repository must not be empty"));
            }
            if e.revision.trim().is_empty() {
                errors.push(format!("{ctx}: external revision must not be empty"));
            }
            if let Some(problem) = work_relative_path_problem(&e.path) {
                errors.push(format!("{ctx}: external path {problem}"));
            }
            for name in template::placeholders(&e.path.to_string_lossy()) {
                if ABSOLUTE_PLACEHOLDERS.contains(&name.as_str()) {
                    errors.push(format!(
                        "{ctx}: external path cannot use '{{{{ {name} }}}}', it renders to an absolute path"
                    ));
                }
            }
            if e.retries > MAX_EXTERNAL_RETRIES {
                errors.push(format!(
                    "{ctx}: retries must be <= {MAX_EXTERNAL_RETRIES}, got {}",
                    e.retries
                ));
            }
            if let Some(clone) = &e.clone {
                check_command(clone, &format!("{ctx} clone"), errors);
            }
            if let Some(install) = &e.install {
                check_command(install, &format!("{ctx} install"), errors);
            }
            check_command(&e.build, &format!("{ctx} build"), errors);
        }
        StageAction::Test(t) => {
            if t.suites.is_empty() {
                errors.push(format!("{ctx}: test stage needs at least one suite"));
            }
            if t.parallel && t.fail_fast {
                errors.push(format!("{ctx}: fail_fast cannot be combined with parallel"));
            }
            if t.parallel && t.coverage == CoverageMode::Combined {
                errors.push(format!(
                    "{ctx}: combined coverage cannot be combined with parallel"
                ));
            }
            let mut names = HashSet::new();
            for suite in &t.suites {
                let suite_ctx = format!("{ctx} suite '{}'", suite.name);
                if suite.name.trim().is_empty() {
                    errors.push(format!("{ctx}: suite name must not be empty"));
                } else if !names.insert(suite.name.as_str()) {
                    errors.push(format!("{ctx}: duplicate suite name '{}'", suite.name));
                }
                check_command(&suite.command, &suite_ctx, errors);
                if suite.attempts == 0 {
                    errors.push(format!("{suite_ctx}: attempts must be > 0"));
                } else if suite.attempts > MAX_SUITE_ATTEMPTS {
                    errors.push(format!(
                        "{suite_ctx}: attempts must be <= {MAX_SUITE_ATTEMPTS}, got {}",
                        suite.attempts
                    ));
                } else if suite.allowed_failures >= suite.attempts {
                    errors.push(format!(
                        "{suite_ctx}: allowed_failures ({}) must be less than attempts ({})",
                        suite.allowed_failures, suite.attempts
                    ));
                }
            }
        }
        StageAction::Report(r) => {
            if let ReporterConfig::Command { command } = &r.reporter {
                check_command(command, &format!("{ctx} reporter"), errors);
            }
        }
        StageAction::Run(r) => check_command(&r.command, &ctx, errors),
    }
}

/// Validate a parsed pipeline configuration.
/// Returns `Ok(())` if valid, Err with all validation errors if not.
///
/// # Errors
///
/// Returns an error listing all validation failures found in the pipeline config.
pub fn validate_pipeline(config: &PipelineConfig) -> Result<()> {
    let mut errors = Vec::new();

    if config.version != "1.0" {
        errors.push(format!(
            "Unsupported pipeline version '{}', expected '1.0'",
            config.version
        ));
    }

    if config.pipeline.trim().is_empty() {
        errors.push("Pipeline name must not be empty".to_string());
    }

    if config.protected_branch.trim().is_empty() {
        errors.push("protected_branch must not be empty".to_string());
    }

    if config.defaults.stage_timeout_seconds == 0 {
        errors.push("defaults.stage_timeout_seconds must be > 0".to_string());
    }

    let mut axes = HashSet::new();
    if let Some(m) = &config.matrix {
        if let Err(e) = matrix::expand(Some(m)) {
            errors.push(format!("Invalid matrix: {e}"));
        }
        if m.max_parallel == Some(0) {
            errors.push("matrix.max_parallel must be > 0".to_string());
        }
        axes.extend(m.axes.iter().map(|a| a.name.as_str()));
    }

    if config.stages.is_empty() {
        errors.push("Pipeline must declare at least one stage".to_string());
    }

    let mut names = HashSet::new();
    for stage in &config.stages {
        if stage.name.trim().is_empty() {
            errors.push("Stage name must not be empty".to_string());
        } else if !names.insert(stage.name.as_str()) {
            errors.push(format!("Duplicate stage name '{}'", stage.name));
        }
        if stage.timeout_seconds == Some(0) {
            errors.push(format!("Stage '{}': timeout_seconds must be > 0", stage.name));
        }
        check_action(config, stage, &mut errors);
        check_placeholders(stage, &axes, &mut errors);
    }

    if let Err(graph_errors) = StageGraph::build(&config.stages) {
        errors.extend(graph_errors);
    }

    if !errors.is_empty() {
        bail!("Pipeline validation failed:\n  - {}", errors.join("\n  - "));
    }

    Ok(())
}
