//! Build collaborator: reports which service binaries exist and (re)builds them.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServiceConfig;

#[async_trait]
pub trait Builder: Send + Sync {
    /// Names of services whose binary is not on disk.
    fn missing(&self, services: &[ServiceConfig]) -> Vec<String>;

    /// Build `services` (only the missing ones unless `force`); returns what was built.
    async fn build(
        &self,
        cancel: &CancellationToken,
        services: &[ServiceConfig],
        force: bool,
    ) -> Result<Vec<String>>;

    /// Produce derived artifacts once configuration has been rendered.
    async fn prepare(&self, cancel: &CancellationToken, services: &[ServiceConfig]) -> Result<()>;
}

/// Runs each service's `build` and `prepare` argv inside its repository.
#[derive(Debug, Clone, Default)]
pub struct CommandBuilder {
    /// Extra environment for every build step.
    pub env: BTreeMap<String, String>,
}

impl CommandBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    fn missing(&self, services: &[ServiceConfig]) -> Vec<String> {
        services
            .iter()
            .filter(|svc| !svc.binary.is_file())
            .map(|svc| svc.name.clone())
            .collect()
    }

    async fn build(
        &self,
        cancel: &CancellationToken,
        services: &[ServiceConfig],
        force: bool,
    ) -> Result<Vec<String>> {
        let mut built = Vec::new();
        for svc in services {
            if !force && svc.binary.is_file() {
                continue;
            }
            if svc.build.is_empty() {
                if !svc.binary.is_file() {
                    bail!(
                        "{} has no build command and {} does not exist",
                        svc.name,
                        svc.binary.display()
                    );
                }
                continue;
            }
            info!(name = %svc.name, "building");
            run_argv(cancel, &svc.build, &svc.repo, &self.env)
                .await
                .with_context(|| format!("failed to build {}", svc.name))?;
            if !svc.binary.is_file() {
                bail!(
                    "build for {} finished but {} is still missing",
                    svc.name,
                    svc.binary.display()
                );
            }
            built.push(svc.name.clone());
        }
        Ok(built)
    }

    async fn prepare(&self, cancel: &CancellationToken, services: &[ServiceConfig]) -> Result<()> {
        for svc in services.iter().filter(|svc| !svc.prepare.is_empty()) {
            info!(name = %svc.name, "preparing derived artifacts");
            run_argv(cancel, &svc.prepare, &svc.repo, &self.env)
                .await
                .with_context(|| format!("failed to prepare {}", svc.name))?;
        }
        Ok(())
    }
}

/// Run `argv` in `cwd` to completion, inheriting stdio. Cancelling kills it.
pub async fn run_argv(
    cancel: &CancellationToken,
    argv: &[String],
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<()> {
    let Some((program, args)) = argv.split_first() else {
        return Ok(());
    };
    let mut child = Command::new(program)
        .args(args)
        .envs(env)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("failed to run {program} in {}", cwd.display()))?;

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            bail!("{program} cancelled");
        }
        status = child.wait() => status.with_context(|| format!("failed to wait for {program}"))?,
    };
    if !status.success() {
        bail!(
            "{} exited with status {}",
            argv.join(" "),
            status.code().unwrap_or(-1)
        );
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn service(dir: &Path, name: &str, build: &[&str]) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            tier: Default::default(),
            repo: dir.to_path_buf(),
            binary: dir.join(format!("bin/{name}")),
            args: Vec::new(),
            env: BTreeMap::new(),
            port: None,
            build: build.iter().map(|s| s.to_string()).collect(),
            prepare: Vec::new(),
            config_template: None,
            health: None,
        }
    }

    #[tokio::test]
    async fn builds_only_missing_binaries() {
        let dir = TempDir::new().expect("tempdir");
        fs::create_dir_all(dir.path().join("bin")).expect("mkdir");
        fs::write(dir.path().join("bin/present"), "").expect("write");

        let services = vec![
            service(dir.path(), "present", &["/bin/sh", "-c", "exit 1"]),
            service(dir.path(), "absent", &["/bin/sh", "-c", "touch bin/absent"]),
        ];
        let builder = CommandBuilder::new();
        assert_eq!(builder.missing(&services), ["absent"]);

        let built = builder
            .build(&CancellationToken::new(), &services, false)
            .await
            .expect("build");
        assert_eq!(built, ["absent"]);
        assert!(builder.missing(&services).is_empty());
    }

    #[tokio::test]
    async fn failing_build_names_the_service() {
        let dir = TempDir::new().expect("tempdir");
        let services = vec![service(dir.path(), "api", &["/bin/sh", "-c", "exit 3"])];

        let err = CommandBuilder::new()
            .build(&CancellationToken::new(), &services, true)
            .await
            .expect_err("build fails");
        let msg = format!("{err:#}");
        assert!(msg.contains("failed to build api"), "{msg}");
        assert!(msg.contains("status 3"), "{msg}");
    }

    #[tokio::test]
    async fn prepare_runs_with_builder_env() {
        let dir = TempDir::new().expect("tempdir");
        let mut svc = service(dir.path(), "web", &[]);
        svc.prepare = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo \"$NETWORK\" > prepared".to_string(),
        ];

        CommandBuilder::new()
            .with_env("NETWORK", "devnet")
            .prepare(&CancellationToken::new(), &[svc])
            .await
            .expect("prepare");
        let prepared = fs::read_to_string(PathBuf::from(dir.path()).join("prepared")).expect("read");
        assert_eq!(prepared.trim(), "devnet");
    }

    #[tokio::test]
    async fn cancelled_command_is_killed() {
        let dir = TempDir::new().expect("tempdir");
        let cancel = CancellationToken::new();
        cancel.cancel();
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), "sleep 30".to_string()];

        let err = run_argv(&cancel, &argv, dir.path(), &BTreeMap::new())
            .await
            .expect_err("cancelled");
        assert!(err.to_string().contains("cancelled"));
    }
}
