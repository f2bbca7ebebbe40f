//! Infrastructure collaborator: auxiliary containers the services depend on.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::builder::run_argv;
use crate::config::Config;
use crate::health::{HealthChecker, PortChecker};

const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(120);

#[async_trait]
pub trait Infrastructure: Send + Sync {
    async fn start(&self, cancel: &CancellationToken) -> Result<()>;

    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()>;

    /// Apply schema for `network`. Callers treat failure as a warning.
    async fn setup_schema(&self, cancel: &CancellationToken, network: &str) -> Result<()>;

    /// Destructive teardown, volumes included.
    async fn reset(&self, cancel: &CancellationToken) -> Result<()>;
}

/// Stacks without an `[infra]` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInfra;

#[async_trait]
impl Infrastructure for NoInfra {
    async fn start(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn wait_ready(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }

    async fn setup_schema(&self, _cancel: &CancellationToken, _network: &str) -> Result<()> {
        Ok(())
    }

    async fn reset(&self, _cancel: &CancellationToken) -> Result<()> {
        Ok(())
    }
}

/// `docker compose` driven infrastructure.
#[derive(Debug, Clone)]
pub struct ComposeInfra {
    pub compose_file: PathBuf,
    pub project: String,
    pub ready_ports: Vec<u16>,
    pub ready_timeout: Duration,
    pub schema_command: Vec<String>,
    pub workdir: PathBuf,
}

impl ComposeInfra {
    pub fn from_config(cfg: &Config) -> Option<Self> {
        let infra = cfg.infra.as_ref()?;
        Some(Self {
            compose_file: infra.compose_file.clone(),
            project: cfg.project().to_string(),
            ready_ports: infra.ready_ports.clone(),
            ready_timeout: infra
                .ready_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_READY_TIMEOUT),
            schema_command: infra.schema_command.clone(),
            workdir: cfg.root.clone(),
        })
    }

    fn compose_argv(&self, tail: &[&str]) -> Vec<String> {
        let mut argv = vec![
            "docker".to_string(),
            "compose".to_string(),
            "-p".to_string(),
            self.project.clone(),
            "-f".to_string(),
            self.compose_file.display().to_string(),
        ];
        argv.extend(tail.iter().map(|s| s.to_string()));
        argv
    }

    async fn compose(&self, cancel: &CancellationToken, tail: &[&str]) -> Result<()> {
        if which::which("docker").is_err() {
            bail!("docker not found on PATH");
        }
        run_argv(cancel, &self.compose_argv(tail), &self.workdir, &BTreeMap::new()).await
    }
}

/// Pick the collaborator for `cfg`.
pub fn from_config(cfg: &Config) -> Box<dyn Infrastructure> {
    match ComposeInfra::from_config(cfg) {
        Some(compose) => Box::new(compose),
        None => Box::new(NoInfra),
    }
}

#[async_trait]
impl Infrastructure for ComposeInfra {
    async fn start(&self, cancel: &CancellationToken) -> Result<()> {
        info!(project = %self.project, "starting infrastructure");
        self.compose(cancel, &["up", "-d"])
            .await
            .with_context(|| format!("failed to start {}", self.compose_file.display()))
    }

    async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        for &port in &self.ready_ports {
            let checker = PortChecker::new("127.0.0.1", port).with_timeout(self.ready_timeout);
            checker
                .check(cancel)
                .await
                .with_context(|| format!("infrastructure port {port} never became ready"))?;
        }
        Ok(())
    }

    async fn setup_schema(&self, cancel: &CancellationToken, network: &str) -> Result<()> {
        if self.schema_command.is_empty() {
            return Ok(());
        }
        let env = BTreeMap::from([("NETWORK".to_string(), network.to_string())]);
        run_argv(cancel, &self.schema_command, &self.workdir, &env)
            .await
            .with_context(|| format!("schema setup failed for network {network}"))
    }

    async fn reset(&self, cancel: &CancellationToken) -> Result<()> {
        info!(project = %self.project, "tearing down infrastructure");
        self.compose(cancel, &["down", "-v", "--remove-orphans"])
            .await
            .with_context(|| format!("failed to tear down {}", self.compose_file.display()))
    }
}
