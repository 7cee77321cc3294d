use crate::config::types::RunStage;
use crate::context::ContextDelta;
use crate::errors::StageError;

use super::{StageEnv, StageOutput};

pub(super) async fn run(stage: &RunStage, env: &StageEnv) -> Result<StageOutput, StageError> {
    let vars = &env.ctx.vars;
    let command = env.command(vars, &stage.command)?;
    let mut extra = Vec::with_capacity(stage.env.len());
    for (key, value) in &stage.env {
        extra.push((key.clone(), env.render(vars, value)?));
    }
    match env.exec(&command, &env.ctx.workspace, &extra).await? {
        0 => Ok(StageOutput::with_delta(ContextDelta::default())),
        code => Err(StageError::CommandFailed {
            command: command.to_string(),
            code,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::config::types::CommandLine;
    use crate::stages::testing;

    #[tokio::test]
    async fn env_values_are_rendered() {
        let dir = tempfile::tempdir().unwrap();
        let mut env = testing::env(dir.path(), "lint");
        env.ctx.vars.insert("matrix.os", "linux");
        let stage = RunStage {
            command: CommandLine::Shell("test \"$TARGET_OS\" = linux".into()),
            env: BTreeMap::from([("TARGET_OS".to_string(), "{{ matrix.os }}".to_string())]),
        };
        run(&stage, &env).await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_is_command_failed() {
        let dir = tempfile::tempdir().unwrap();
        let env = testing::env(dir.path(), "lint");
        let stage = RunStage {
            command: CommandLine::Argv(vec!["sh".into(), "-c".into(), "exit 4".into()]),
            env: BTreeMap::new(),
        };
        let err = run(&stage, &env).await.unwrap_err();
        assert!(matches!(err, StageError::CommandFailed { code: 4, .. }));
        assert!(err.is_fatal());
    }
}
