//! Up/Down/Status control loop for the whole developer stack.
//!
//! Up is a sequence of hard gates: the first failing phase aborts and is
//! named in the error. Down is best-effort; only the infrastructure teardown
//! can fail it.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, anyhow};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::builder::Builder;
use crate::config::{Config, ServiceConfig, Tier};
use crate::configgen::ConfigGenerator;
use crate::error::SupervisorError;
use crate::health;
use crate::infra::Infrastructure;
use crate::logs;
use crate::ports::{self, PortConflict};
use crate::registry::{ProcessInfo, SpawnSpec, Supervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpPhase {
    Build,
    Infrastructure,
    Configure,
    Prepare,
    Preflight,
    Launch,
}

impl fmt::Display for UpPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UpPhase::Build => "build",
            UpPhase::Infrastructure => "infrastructure",
            UpPhase::Configure => "configuration",
            UpPhase::Prepare => "derived artifacts",
            UpPhase::Preflight => "port pre-flight",
            UpPhase::Launch => "launch",
        })
    }
}

#[derive(Debug, Error)]
#[error("up failed during {phase}")]
pub struct UpError {
    pub phase: UpPhase,
    #[source]
    pub source: anyhow::Error,
}

trait PhaseExt<T> {
    fn phase(self, phase: UpPhase) -> Result<T, UpError>;
}

impl<T, E: Into<anyhow::Error>> PhaseExt<T> for Result<T, E> {
    fn phase(self, phase: UpPhase) -> Result<T, UpError> {
        self.map_err(|err| UpError {
            phase,
            source: err.into(),
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UpOptions {
    /// Fail instead of building when a binary is missing.
    pub skip_build: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub name: String,
    pub pid: u32,
    pub url: Option<String>,
    /// Already running before this Up.
    pub reused: bool,
}

#[derive(Debug, Default)]
pub struct UpReport {
    pub endpoints: Vec<Endpoint>,
    pub built: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Default)]
pub struct DownReport {
    pub killed: Vec<PortConflict>,
    pub logs_removed: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub tier: Tier,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub running: bool,
}

#[derive(Debug, Default)]
pub struct StatusReport {
    pub services: Vec<ServiceStatus>,
    /// Expected ports held by something this supervisor does not manage.
    pub orphans: Vec<PortConflict>,
    /// Managed processes with no matching service in the config.
    pub unknown: Vec<ProcessInfo>,
}

/// Services in start order: engines, APIs, backend, frontend.
pub fn launch_order(services: &[ServiceConfig]) -> Vec<&ServiceConfig> {
    let mut ordered: Vec<_> = services.iter().collect();
    ordered.sort_by_key(|svc| svc.tier);
    ordered
}

/// How a configured service is spawned.
pub fn spawn_spec(cfg: &Config, svc: &ServiceConfig, config_file: Option<&Path>) -> SpawnSpec {
    let mut spec = SpawnSpec::new(&svc.binary).working_dir(&svc.repo);
    if let Some(path) = config_file {
        spec = spec.args(["--config".to_string(), path.display().to_string()]);
    }
    spec = spec.args(svc.args.iter().cloned());
    spec.env = svc.env.clone();
    spec.env.insert("NETWORK".to_string(), cfg.network().to_string());
    spec
}

pub struct Stack<'a> {
    cfg: &'a Config,
    supervisor: &'a Supervisor,
    builder: &'a dyn Builder,
    infra: &'a dyn Infrastructure,
    configgen: &'a dyn ConfigGenerator,
}

impl<'a> Stack<'a> {
    pub fn new(
        cfg: &'a Config,
        supervisor: &'a Supervisor,
        builder: &'a dyn Builder,
        infra: &'a dyn Infrastructure,
        configgen: &'a dyn ConfigGenerator,
    ) -> Self {
        Self {
            cfg,
            supervisor,
            builder,
            infra,
            configgen,
        }
    }

    pub async fn up(&self, cancel: &CancellationToken, opts: UpOptions) -> Result<UpReport, UpError> {
        let services = &self.cfg.services;
        let mut report = UpReport::default();

        if opts.skip_build {
            let missing = self.builder.missing(services);
            if !missing.is_empty() {
                return Err(UpError {
                    phase: UpPhase::Build,
                    source: anyhow!("missing binaries for {}", missing.join(", ")),
                });
            }
        } else {
            report.built = self
                .builder
                .build(cancel, services, false)
                .await
                .phase(UpPhase::Build)?;
        }

        self.infra.start(cancel).await.phase(UpPhase::Infrastructure)?;
        self.infra
            .wait_ready(cancel)
            .await
            .phase(UpPhase::Infrastructure)?;

        let network = self.cfg.network();
        if let Err(err) = self.infra.setup_schema(cancel, network).await {
            warn!(network, error = %format!("{err:#}"), "schema setup failed; continuing");
            report.warnings.push(format!("schema setup for {network}: {err:#}"));
        }

        let configs = self
            .configgen
            .generate(self.cfg, &self.supervisor.layout().configs())
            .phase(UpPhase::Configure)?;

        self.builder
            .prepare(cancel, services)
            .await
            .phase(UpPhase::Prepare)?;

        let pending: Vec<_> = launch_order(services)
            .into_iter()
            .filter(|svc| !self.supervisor.is_running(&svc.name))
            .collect();
        let expected: Vec<u16> = pending.iter().filter_map(|svc| svc.port).collect();
        let conflicts = ports::check_ports(&expected);
        if !conflicts.is_empty() {
            let detail: Vec<_> = conflicts.iter().map(ToString::to_string).collect();
            return Err(UpError {
                phase: UpPhase::Preflight,
                source: anyhow!("{}", detail.join("; ")),
            });
        }

        for svc in launch_order(services) {
            if self.supervisor.is_running(&svc.name) {
                if let Some(info) = self.supervisor.get(&svc.name) {
                    report.endpoints.push(endpoint(svc, info.pid, true));
                    continue;
                }
            }
            let info = self
                .start_service(cancel, svc, configs.get(&svc.name).map(|p| p.as_path()))
                .await
                .with_context(|| format!("failed to start {}", svc.name))
                .phase(UpPhase::Launch)?;
            report.endpoints.push(endpoint(svc, info.pid, false));
        }

        Ok(report)
    }

    async fn start_service(
        &self,
        cancel: &CancellationToken,
        svc: &ServiceConfig,
        config_file: Option<&Path>,
    ) -> Result<ProcessInfo, SupervisorError> {
        let checker = health::checker_for(svc.health.as_ref(), svc.port);
        let spec = spawn_spec(self.cfg, svc, config_file);
        info!(name = %svc.name, tier = svc.tier.as_str(), checker = %checker.name(), "launching");
        self.supervisor
            .start(cancel, &svc.name, spec, Some(checker.as_ref()))
            .await
    }

    /// Restart one service. Processes adopted from an earlier run have no
    /// spawn handle, so they are stopped and started fresh from config.
    pub async fn restart(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> anyhow::Result<ProcessInfo> {
        match self.supervisor.restart(cancel, name).await {
            Ok(info) => Ok(info),
            Err(SupervisorError::Unsupported { .. }) | Err(SupervisorError::NotFound(_)) => {
                let svc = self
                    .cfg
                    .service(name)
                    .with_context(|| format!("no service named '{name}' in config"))?;
                match self.supervisor.stop(cancel, name).await {
                    Ok(_) | Err(SupervisorError::NotFound(_)) => {}
                    Err(err) => return Err(err.into()),
                }
                let config_file = self.supervisor.layout().config_file(name);
                let config_file = config_file.is_file().then_some(config_file);
                Ok(self
                    .start_service(cancel, svc, config_file.as_deref())
                    .await?)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Tear everything down. Only an infrastructure teardown failure is an error.
    pub async fn down(&self, cancel: &CancellationToken) -> anyhow::Result<DownReport> {
        let mut report = DownReport::default();

        match self.supervisor.stop_all(cancel).await {
            Ok(()) => {}
            Err(SupervisorError::Cancelled) => anyhow::bail!("down cancelled"),
            Err(err) => {
                warn!(error = %err, "some processes failed to stop");
                report.warnings.push(err.to_string());
            }
        }

        for conflict in ports::check_ports(&self.cfg.expected_ports()) {
            let Some(pid) = conflict.pid else {
                report
                    .warnings
                    .push(format!("{conflict}; owner could not be resolved"));
                continue;
            };
            let killed = tokio::task::spawn_blocking(move || ports::kill_process(pid)).await;
            match killed {
                Ok(Ok(())) => {
                    info!(port = conflict.port, pid, "killed orphan");
                    report.killed.push(conflict);
                }
                Ok(Err(err)) => report
                    .warnings
                    .push(format!("failed to kill orphan on port {}: {err}", conflict.port)),
                Err(err) => report.warnings.push(format!("orphan kill task failed: {err}")),
            }
        }

        match logs::remove_all(&self.supervisor.layout().logs()) {
            Ok(count) => report.logs_removed = count,
            Err(err) => report.warnings.push(format!("failed to remove logs: {err}")),
        }

        self.infra
            .reset(cancel)
            .await
            .context("infrastructure teardown failed")?;
        Ok(report)
    }

    pub fn status(&self) -> StatusReport {
        let mut report = StatusReport::default();
        let managed: BTreeMap<String, ProcessInfo> = self
            .supervisor
            .list()
            .into_iter()
            .map(|info| (info.name.clone(), info))
            .collect();

        for svc in launch_order(&self.cfg.services) {
            let entry = managed.get(&svc.name);
            report.services.push(ServiceStatus {
                name: svc.name.clone(),
                tier: svc.tier,
                port: svc.port,
                pid: entry.map(|info| info.pid),
                running: self.supervisor.is_running(&svc.name),
            });
            if entry.is_none() {
                if let Some(conflict) = svc.port.and_then(ports::check_port) {
                    report.orphans.push(conflict);
                }
            }
        }

        report.unknown = managed
            .into_values()
            .filter(|info| self.cfg.service(&info.name).is_none())
            .collect();
        report
    }
}

fn endpoint(svc: &ServiceConfig, pid: u32, reused: bool) -> Endpoint {
    Endpoint {
        name: svc.name.clone(),
        pid,
        url: svc.port.map(|port| format!("http://127.0.0.1:{port}")),
        reused,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::StateLayout;
    use crate::shutdown::ShutdownPolicy;
    use anyhow::{Result, bail};
    use async_trait::async_trait;
    use std::net::TcpListener;
    use std::path::PathBuf;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Calls(Mutex<Vec<String>>);

    impl Calls {
        fn push(&self, call: &str) {
            self.0.lock().expect("calls").push(call.to_string());
        }

        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().expect("calls"))
        }
    }

    #[derive(Default)]
    struct FakeBuilder {
        calls: Calls,
        fail: bool,
    }

    #[async_trait]
    impl Builder for FakeBuilder {
        fn missing(&self, _services: &[ServiceConfig]) -> Vec<String> {
            Vec::new()
        }

        async fn build(
            &self,
            _cancel: &CancellationToken,
            _services: &[ServiceConfig],
            _force: bool,
        ) -> Result<Vec<String>> {
            self.calls.push("build");
            if self.fail {
                bail!("compiler exploded");
            }
            Ok(Vec::new())
        }

        async fn prepare(&self, _cancel: &CancellationToken, _services: &[ServiceConfig]) -> Result<()> {
            self.calls.push("prepare");
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeInfra {
        calls: Calls,
        fail_schema: bool,
        fail_reset: bool,
    }

    #[async_trait]
    impl Infrastructure for FakeInfra {
        async fn start(&self, _cancel: &CancellationToken) -> Result<()> {
            self.calls.push("infra.start");
            Ok(())
        }

        async fn wait_ready(&self, _cancel: &CancellationToken) -> Result<()> {
            self.calls.push("infra.ready");
            Ok(())
        }

        async fn setup_schema(&self, _cancel: &CancellationToken, network: &str) -> Result<()> {
            self.calls.push(&format!("schema:{network}"));
            if self.fail_schema {
                bail!("migration locked");
            }
            Ok(())
        }

        async fn reset(&self, _cancel: &CancellationToken) -> Result<()> {
            self.calls.push("infra.reset");
            if self.fail_reset {
                bail!("volume busy");
            }
            Ok(())
        }
    }

    struct NoConfigs;

    impl ConfigGenerator for NoConfigs {
        fn generate(&self, _cfg: &Config, _out_dir: &Path) -> Result<BTreeMap<String, PathBuf>> {
            Ok(BTreeMap::new())
        }
    }

    fn service(name: &str, tier: Tier, port: Option<u16>) -> ServiceConfig {
        ServiceConfig {
            name: name.to_string(),
            tier,
            repo: PathBuf::from("/"),
            binary: PathBuf::from("/bin/sh"),
            args: vec!["-c".to_string(), "exec sleep 30".to_string()],
            env: BTreeMap::new(),
            port,
            build: Vec::new(),
            prepare: Vec::new(),
            config_template: None,
            health: None,
        }
    }

    fn config(services: Vec<ServiceConfig>) -> Config {
        Config {
            network: Some("testnet".to_string()),
            services,
            ..Config::default()
        }
    }

    fn supervisor(dir: &TempDir) -> Supervisor {
        Supervisor::open(
            StateLayout::new(dir.path()),
            ShutdownPolicy {
                grace: Duration::from_millis(500),
                poll_interval: Duration::from_millis(50),
            },
        )
        .expect("supervisor")
    }

    fn free_port() -> u16 {
        let listener = TcpListener::bind(("0.0.0.0", 0)).expect("bind");
        listener.local_addr().expect("addr").port()
    }

    #[test]
    fn launch_order_follows_tiers() {
        let services = vec![
            service("web", Tier::Frontend, None),
            service("backend", Tier::Backend, None),
            service("engine", Tier::Engine, None),
            service("api", Tier::Api, None),
        ];
        let names: Vec<_> = launch_order(&services).iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["engine", "api", "backend", "web"]);
    }

    #[test]
    fn spawn_spec_passes_config_and_network() {
        let cfg = config(Vec::new());
        let svc = service("api", Tier::Api, Some(8080));
        let spec = spawn_spec(&cfg, &svc, Some(Path::new("/state/configs/api.yaml")));

        assert_eq!(spec.binary, PathBuf::from("/bin/sh"));
        assert_eq!(&spec.args[..2], ["--config", "/state/configs/api.yaml"]);
        assert_eq!(spec.working_dir.as_deref(), Some(Path::new("/")));
        assert_eq!(spec.env.get("NETWORK").map(String::as_str), Some("testnet"));
    }

    #[tokio::test]
    async fn up_then_down_runs_every_phase() {
        let dir = TempDir::new().expect("tempdir");
        let sup = supervisor(&dir);
        let cfg = config(vec![
            service("web", Tier::Frontend, None),
            service("engine", Tier::Engine, None),
        ]);
        let builder = FakeBuilder::default();
        let infra = FakeInfra::default();
        let stack = Stack::new(&cfg, &sup, &builder, &infra, &NoConfigs);
        let cancel = CancellationToken::new();

        let report = stack.up(&cancel, UpOptions::default()).await.expect("up");
        let names: Vec<_> = report.endpoints.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["engine", "web"]);
        assert!(report.warnings.is_empty());
        assert_eq!(builder.calls.take(), ["build", "prepare"]);
        assert_eq!(infra.calls.take(), ["infra.start", "infra.ready", "schema:testnet"]);
        assert!(sup.is_running("engine") && sup.is_running("web"));

        let again = stack.up(&cancel, UpOptions::default()).await.expect("second up");
        assert!(again.endpoints.iter().all(|e| e.reused));

        let down = stack.down(&cancel).await.expect("down");
        assert!(sup.list().is_empty());
        assert_eq!(down.logs_removed, 2);
        assert!(infra.calls.take().ends_with(&["infra.reset".to_string()]));
    }

    #[tokio::test]
    async fn build_failure_names_the_phase() {
        let dir = TempDir::new().expect("tempdir");
        let sup = supervisor(&dir);
        let cfg = config(vec![service("api", Tier::Api, None)]);
        let builder = FakeBuilder {
            fail: true,
            ..FakeBuilder::default()
        };
        let infra = FakeInfra::default();
        let stack = Stack::new(&cfg, &sup, &builder, &infra, &NoConfigs);

        let err = stack
            .up(&CancellationToken::new(), UpOptions::default())
            .await
            .expect_err("build fails");
        assert_eq!(err.phase, UpPhase::Build);
        assert_eq!(err.to_string(), "up failed during build");
        assert!(infra.calls.take().is_empty());
        assert!(sup.list().is_empty());
    }

    #[tokio::test]
    async fn schema_failure_is_only_a_warning() {
        let dir = TempDir::new().expect("tempdir");
        let sup = supervisor(&dir);
        let cfg = config(vec![service("api", Tier::Api, None)]);
        let builder = FakeBuilder::default();
        let infra = FakeInfra {
            fail_schema: true,
            ..FakeInfra::default()
        };
        let stack = Stack::new(&cfg, &sup, &builder, &infra, &NoConfigs);
        let cancel = CancellationToken::new();

        let report = stack.up(&cancel, UpOptions::default()).await.expect("up");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("migration locked"));
        assert!(sup.is_running("api"));

        sup.stop_all(&cancel).await.expect("cleanup");
    }

    #[tokio::test]
    async fn occupied_port_blocks_launch() {
        let dir = TempDir::new().expect("tempdir");
        let sup = supervisor(&dir);
        let blocker = TcpListener::bind(("0.0.0.0", 0)).expect("bind");
        let taken = blocker.local_addr().expect("addr").port();
        let cfg = config(vec![
            service("api", Tier::Api, Some(taken)),
            service("web", Tier::Frontend, Some(free_port())),
        ]);
        let builder = FakeBuilder::default();
        let infra = FakeInfra::default();
        let stack = Stack::new(&cfg, &sup, &builder, &infra, &NoConfigs);

        let err = stack
            .up(&CancellationToken::new(), UpOptions::default())
            .await
            .expect_err("preflight");
        assert_eq!(err.phase, UpPhase::Preflight);
        assert!(format!("{:#}", err.source).contains(&taken.to_string()));
        assert!(sup.list().is_empty());
    }

    #[tokio::test]
    async fn status_reports_orphans_and_stopped_services() {
        let dir = TempDir::new().expect("tempdir");
        let sup = supervisor(&dir);
        let orphan = TcpListener::bind(("0.0.0.0", 0)).expect("bind");
        let orphan_port = orphan.local_addr().expect("addr").port();
        let cfg = config(vec![
            service("api", Tier::Api, None),
            service("web", Tier::Frontend, Some(orphan_port)),
        ]);
        let builder = FakeBuilder::default();
        let infra = FakeInfra::default();
        let stack = Stack::new(&cfg, &sup, &builder, &infra, &NoConfigs);
        let cancel = CancellationToken::new();

        sup.start(&cancel, "api", spawn_spec(&cfg, &cfg.services[0], None), None)
            .await
            .expect("start api");

        let status = stack.status();
        let api = &status.services[0];
        assert!(api.running && api.pid.is_some());
        let web = &status.services[1];
        assert!(!web.running && web.pid.is_none());
        assert_eq!(status.orphans.len(), 1);
        assert_eq!(status.orphans[0].port, orphan_port);
        assert!(status.unknown.is_empty());

        sup.stop_all(&cancel).await.expect("cleanup");
    }

    #[tokio::test]
    async fn down_kills_orphan_on_a_configured_port() {
        if which::which("lsof").is_err() || which::which("python3").is_err() {
            eprintln!("skipping: lsof and python3 are required");
            return;
        }
        let dir = TempDir::new().expect("tempdir");
        let sup = supervisor(&dir);
        let port = free_port();
        let script = format!(
            "import socket, time\n\
             s = socket.socket()\n\
             s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
             s.bind(('0.0.0.0', {port}))\n\
             s.listen()\n\
             time.sleep(60)\n"
        );
        let mut orphan = std::process::Command::new("python3")
            .args(["-c", &script])
            .spawn()
            .expect("spawn listener");
        let orphan_pid = orphan.id();
        let reaper = std::thread::spawn(move || orphan.wait());

        let mut owner = None;
        for _ in 0..100 {
            owner = ports::check_port(port).and_then(|c| c.pid);
            if owner.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(owner, Some(orphan_pid));

        let cfg = config(vec![service("web", Tier::Frontend, Some(port))]);
        let builder = FakeBuilder::default();
        let infra = FakeInfra::default();
        let stack = Stack::new(&cfg, &sup, &builder, &infra, &NoConfigs);

        let report = stack.down(&CancellationToken::new()).await.expect("down");
        let killed: Vec<_> = report.killed.iter().map(|c| (c.port, c.pid)).collect();
        assert_eq!(killed, [(port, Some(orphan_pid))]);
        assert!(report.warnings.is_empty(), "{:?}", report.warnings);

        let status = reaper.join().expect("join").expect("wait");
        assert!(!status.success());
        assert!(ports::check_port(port).is_none());
    }

    #[tokio::test]
    async fn down_fails_only_on_infra_teardown() {
        let dir = TempDir::new().expect("tempdir");
        let sup = supervisor(&dir);
        let cfg = config(Vec::new());
        let builder = FakeBuilder::default();
        let infra = FakeInfra {
            fail_reset: true,
            ..FakeInfra::default()
        };
        let stack = Stack::new(&cfg, &sup, &builder, &infra, &NoConfigs);

        let err = stack.down(&CancellationToken::new()).await.expect_err("reset fails");
        assert!(format!("{err:#}").contains("volume busy"));
    }

    #[tokio::test]
    async fn restart_falls_back_to_config_for_adopted_processes() {
        let dir = TempDir::new().expect("tempdir");
        let cfg = config(vec![service("api", Tier::Api, None)]);
        let cancel = CancellationToken::new();

        let first = supervisor(&dir);
        let before = first
            .start(&cancel, "api", spawn_spec(&cfg, &cfg.services[0], None), None)
            .await
            .expect("start");
        drop(first);

        let sup = supervisor(&dir);
        let builder = FakeBuilder::default();
        let infra = FakeInfra::default();
        let stack = Stack::new(&cfg, &sup, &builder, &infra, &NoConfigs);

        let after = stack.restart(&cancel, "api").await.expect("restart");
        assert_ne!(before.pid, after.pid);
        assert!(after.restartable);

        sup.stop_all(&cancel).await.expect("cleanup");
    }
}
