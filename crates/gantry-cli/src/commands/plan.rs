use std::path::Path;
use std::process::ExitCode;

use anyhow::{Context, Result};

use gantry_engine::config::parser;

/// Execute the `plan` command: print expanded instances and stage order.
pub fn execute(pipeline_path: &Path) -> Result<ExitCode> {
    let config = parser::parse_pipeline(pipeline_path)
        .with_context(|| format!("Failed to parse pipeline: {}", pipeline_path.display()))?;
    let plan = gantry_engine::plan(&config)?;

    println!("Pipeline '{}'", config.pipeline);
    println!("Instances ({}):", plan.instances.len());
    for instance in &plan.instances {
        println!("  {:24} {}", instance.slug(), instance.label());
    }
    println!("Stages:");
    for (i, stage) in config.stages.iter().enumerate() {
        let needs: Vec<&str> = plan
            .graph
            .deps(i)
            .iter()
            .map(|&d| config.stages[d].name.as_str())
            .collect();
        let best_effort = if stage.is_best_effort() { " (best effort)" } else { "" };
        if needs.is_empty() {
            println!("  {:20} {}{best_effort}", stage.name, stage.action.kind());
        } else {
            println!(
                "  {:20} {}{best_effort} <- {}",
                stage.name,
                stage.action.kind(),
                needs.join(", ")
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}
