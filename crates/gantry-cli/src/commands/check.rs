use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};

use gantry_engine::config::parser;

/// Execute the `check` command: validate the pipeline and probe its resources.
pub fn execute(pipeline_path: &Path) -> Result<ExitCode> {
    // 1. Parse pipeline YAML
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;

    // 2. Validate structure and probe state backend and workspace
    let result = gantry_engine::check_pipeline(&config)?;
    println!("Pipeline structure: OK ({} instance(s))", result.instances);
    println!("State backend:      {}", ok_or_failed(result.state));
    println!("Workspace:          {}", ok_or_failed(result.workspace));

    if result.is_ok() {
        println!("\nAll checks passed.");
        Ok(ExitCode::SUCCESS)
    } else {
        anyhow::bail!("One or more checks failed")
    }
}

fn ok_or_failed(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "FAILED"
    }
}
