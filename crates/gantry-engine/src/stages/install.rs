use sha2::{Digest, Sha256};

use crate::config::types::InstallStage;
use crate::context::ContextDelta;
use crate::errors::StageError;

use super::{StageEnv, StageOutput};

/// Variable exported to install commands when a prefetch cache exists.
pub(crate) const CACHE_DIR_ENV: &str = "GANTRY_CACHE_DIR";

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

pub(super) async fn run(stage: &InstallStage, env: &StageEnv) -> Result<StageOutput, StageError> {
    let vars = &env.ctx.vars;
    let manifest = env
        .ctx
        .workspace_path(&env.render_path(vars, &stage.manifest)?);
    let contents = std::fs::read(&manifest).map_err(|e| {
        StageError::DependencyResolution(format!("manifest {}: {e}", manifest.display()))
    })?;
    let manifest_digest = sha256_hex(&contents);
    let command = env.command(vars, &stage.command)?;

    // The stamp covers everything that would change the installed result.
    let stamp_value = sha256_hex(
        format!(
            "{manifest_digest}\n{}\n{command}",
            env.ctx.toolchain_fingerprint()
        )
        .as_bytes(),
    );
    let stamp = env.ctx.layout.state.join(format!("install-{}.stamp", env.stage));
    if std::fs::read_to_string(&stamp).is_ok_and(|v| v.trim() == stamp_value) {
        tracing::info!(
            instance = %env.instance,
            stage = %env.stage,
            manifest = %manifest.display(),
            "Dependencies already satisfied"
        );
        env.note("dependencies already satisfied, skipping install");
        return Ok(StageOutput::with_delta(ContextDelta::default()));
    }

    let mut extra_env = Vec::new();
    let mut delta = ContextDelta::default();
    if let Some(prefetch) = &stage.prefetch {
        let prefetch = env.command(vars, prefetch)?;
        let key = format!("prefetch-{}", &manifest_digest[..16]);
        let cache_dir = env
            .cache
            .get_or_populate(&key, |dir| {
                let prefetch = &prefetch;
                let workspace = &env.ctx.workspace;
                async move {
                    let cache_env = [(CACHE_DIR_ENV.to_string(), dir.to_string_lossy().into_owned())];
                    env.exec_ok(prefetch, workspace, &cache_env, |msg| {
                        StageError::DependencyResolution(format!("prefetch failed: {msg}"))
                    })
                    .await
                }
            })
            .await?;
        let value = cache_dir.to_string_lossy().into_owned();
        extra_env.push((CACHE_DIR_ENV.to_string(), value.clone()));
        delta.env.push((CACHE_DIR_ENV.to_string(), value));
    }

    env.exec_ok(&command, &env.ctx.workspace, &extra_env, |msg| {
        StageError::DependencyResolution(msg)
    })
    .await?;

    std::fs::create_dir_all(&env.ctx.layout.state)?;
    std::fs::write(&stamp, &stamp_value)?;
    tracing::info!(
        instance = %env.instance,
        stage = %env.stage,
        manifest = %manifest.display(),
        "Installed dependencies"
    );
    Ok(StageOutput::with_delta(delta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::CommandLine;
    use crate::stages::testing;

    fn stage(command: &str) -> InstallStage {
        InstallStage {
            manifest: "requirements.txt".into(),
            command: CommandLine::Shell(command.into()),
            prefetch: None,
        }
    }

    #[tokio::test]
    async fn second_install_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let env = testing::env(dir.path(), "deps");
        std::fs::write(env.ctx.workspace.join("requirements.txt"), "six==1.16\n").unwrap();
        let stage = stage("echo run >> count.txt");

        run(&stage, &env).await.unwrap();
        run(&stage, &env).await.unwrap();

        let count = std::fs::read_to_string(env.ctx.workspace.join("count.txt")).unwrap();
        assert_eq!(count.lines().count(), 1);
    }

    #[tokio::test]
    async fn changed_manifest_reinstalls() {
        let dir = tempfile::tempdir().unwrap();
        let env = testing::env(dir.path(), "deps");
        let manifest = env.ctx.workspace.join("requirements.txt");
        let stage = stage("echo run >> count.txt");

        std::fs::write(&manifest, "six==1.16\n").unwrap();
        run(&stage, &env).await.unwrap();
        std::fs::write(&manifest, "six==1.17\n").unwrap();
        run(&stage, &env).await.unwrap();

        let count = std::fs::read_to_string(env.ctx.workspace.join("count.txt")).unwrap();
        assert_eq!(count.lines().count(), 2);
    }

    #[tokio::test]
    async fn missing_manifest_is_dependency_error() {
        let dir = tempfile::tempdir().unwrap();
        let env = testing::env(dir.path(), "deps");
        let err = run(&stage("true"), &env).await.unwrap_err();
        assert!(matches!(err, StageError::DependencyResolution(_)));
    }

    #[tokio::test]
    async fn failing_install_is_dependency_error_and_not_stamped() {
        let dir = tempfile::tempdir().unwrap();
        let env = testing::env(dir.path(), "deps");
        std::fs::write(env.ctx.workspace.join("requirements.txt"), "x\n").unwrap();
        let err = run(&stage("exit 1"), &env).await.unwrap_err();
        assert!(matches!(err, StageError::DependencyResolution(_)));
        assert!(!env.ctx.layout.state.join("install-deps.stamp").exists());
    }

    #[tokio::test]
    async fn prefetch_populates_shared_cache_and_exports_it() {
        let dir = tempfile::tempdir().unwrap();
        let env = testing::env(dir.path(), "deps");
        std::fs::write(env.ctx.workspace.join("requirements.txt"), "x\n").unwrap();
        let stage = InstallStage {
            manifest: "requirements.txt".into(),
            command: CommandLine::Shell("test -f \"$GANTRY_CACHE_DIR/wheel\"".into()),
            prefetch: Some(CommandLine::Shell("touch \"$GANTRY_CACHE_DIR/wheel\"".into())),
        };
        let output = run(&stage, &env).await.unwrap();
        assert_eq!(output.delta.env.len(), 1);
        assert_eq!(output.delta.env[0].0, CACHE_DIR_ENV);
    }
}
