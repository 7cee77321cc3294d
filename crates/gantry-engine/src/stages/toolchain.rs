use crate::config::types::ToolchainStage;
use crate::context::{ContextDelta, ToolchainRequest};
use crate::errors::StageError;

use super::{StageEnv, StageOutput};

pub(super) fn run(stage: &ToolchainStage, env: &StageEnv) -> Result<StageOutput, StageError> {
    let vars = &env.ctx.vars;
    let request = ToolchainRequest {
        family: env.render(vars, &stage.family)?,
        version: env.render(vars, &stage.version)?,
        bin_dir: stage
            .bin_dir
            .as_deref()
            .map(|dir| env.render_path(vars, dir).map(|p| env.ctx.workspace_path(&p)))
            .transpose()?,
    };
    let toolchain = env.provisioner.provision(&request)?;
    tracing::info!(
        instance = %env.instance,
        family = %toolchain.family,
        version = %toolchain.version,
        bin_dir = %toolchain.bin_dir.display(),
        "Provisioned toolchain"
    );
    env.note(&format!(
        "toolchain {} {} at {}",
        toolchain.family,
        toolchain.version,
        toolchain.bin_dir.display()
    ));
    Ok(StageOutput::with_delta(ContextDelta {
        toolchain: Some(toolchain),
        ..ContextDelta::default()
    }))
}
