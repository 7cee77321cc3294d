use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use gantry_engine::CancellationController;
use gantry_state::SqliteStateBackend;

/// Execute the `cancel` command. Cancelling a finished run is not an error.
pub fn execute(state_path: &Path, run_id: i64) -> Result<ExitCode> {
    let state = SqliteStateBackend::open(state_path)
        .with_context(|| format!("Failed to open state DB {}", state_path.display()))?;
    let controller = CancellationController::new(Arc::new(state));
    if controller.cancel_run(run_id, "cancelled by request")? {
        println!("Run {run_id} cancelled.");
    } else {
        println!("Run {run_id} is not active; nothing to do.");
    }
    Ok(ExitCode::SUCCESS)
}
