use crate::config::types::CompileStage;
use crate::context::ContextDelta;
use crate::errors::StageError;

use super::{StageEnv, StageOutput};

pub(super) async fn run(stage: &CompileStage, env: &StageEnv) -> Result<StageOutput, StageError> {
    let vars = &env.ctx.vars;
    let out_dir = env
        .ctx
        .workspace_path(&env.render_path(vars, &stage.out_dir)?);
    std::fs::create_dir_all(&out_dir).map_err(|e| {
        StageError::Compilation(format!("cannot create {}: {e}", out_dir.display()))
    })?;

    // Check every source before compiling any of them.
    let mut sources = Vec::with_capacity(stage.sources.len());
    for source in &stage.sources {
        let path = env.ctx.workspace_path(&env.render_path(vars, source)?);
        if !path.is_file() {
            return Err(StageError::Compilation(format!(
                "source {} does not exist",
                path.display()
            )));
        }
        sources.push(path);
    }

    let out_dir_str = out_dir.to_string_lossy().into_owned();
    for source in &sources {
        let bound = vars
            .with("source", source.to_string_lossy())
            .with("out_dir", out_dir_str.as_str());
        let command = env.command(&bound, &stage.command)?;
        env.exec_ok(&command, &env.ctx.workspace, &[], StageError::Compilation)
            .await?;
    }

    let missing: Vec<String> = stage
        .outputs
        .iter()
        .map(|output| {
            env.render_path(vars, output)
                .map(|p| env.ctx.workspace_path(&p))
        })
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .filter(|p| !p.exists())
        .map(|p| p.display().to_string())
        .collect();
    if !missing.is_empty() {
        return Err(StageError::Compilation(format!(
            "declared outputs missing: {}",
            missing.join(", ")
        )));
    }

    tracing::info!(
        instance = %env.instance,
        stage = %env.stage,
        sources = sources.len(),
        outputs = stage.outputs.len(),
        "Compiled artifacts"
    );
    Ok(StageOutput::with_delta(ContextDelta::default()))
}
