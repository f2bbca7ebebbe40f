use std::{
    collections::{BTreeMap, HashSet},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use shellexpand::tilde;

use crate::shutdown::ShutdownPolicy;

pub const CONFIG_FILE_NAME: &str = "devstack.toml";
pub const STATE_DIR_ENV: &str = "DEVSTACK_STATE_DIR";
const DEFAULT_NETWORK: &str = "local";

/// Top-level `devstack.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Human-friendly stack name, used as the default compose project.
    #[serde(default)]
    pub name: Option<String>,
    /// Network identifier handed to services and schema setup.
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub state_dir: Option<String>,
    /// Additional config files whose services are merged into this one.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    #[serde(default)]
    pub infra: Option<InfraConfig>,
    #[serde(default, rename = "service", alias = "services")]
    pub services: Vec<ServiceConfig>,
    /// Directory containing the root config file.
    #[serde(skip)]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_grace_ms")]
    pub grace_ms: u64,
    #[serde(default = "default_poll_ms")]
    pub poll_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_ms: default_grace_ms(),
            poll_ms: default_poll_ms(),
        }
    }
}

impl ShutdownConfig {
    pub fn policy(&self) -> ShutdownPolicy {
        ShutdownPolicy {
            grace: Duration::from_millis(self.grace_ms),
            poll_interval: Duration::from_millis(self.poll_ms.max(1)),
        }
    }
}

fn default_grace_ms() -> u64 {
    10_000
}

fn default_poll_ms() -> u64 {
    100
}

/// Auxiliary containers started before any managed process.
#[derive(Debug, Clone, Deserialize)]
pub struct InfraConfig {
    pub compose_file: PathBuf,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub ready_ports: Vec<u16>,
    #[serde(default)]
    pub ready_timeout_secs: Option<u64>,
    /// Argv run once per network after infrastructure is ready.
    #[serde(default)]
    pub schema_command: Vec<String>,
}

/// Startup tier; services start in this order and stop in reverse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Engine,
    Api,
    #[default]
    Backend,
    Frontend,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Engine => "engine",
            Tier::Api => "api",
            Tier::Backend => "backend",
            Tier::Frontend => "frontend",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default)]
    pub tier: Tier,
    /// Repository checkout; the working directory of the process.
    pub repo: PathBuf,
    /// Executable, relative to `repo` unless absolute.
    pub binary: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub build: Vec<String>,
    /// Derived artifacts produced after configs are rendered.
    #[serde(default)]
    pub prepare: Vec<String>,
    #[serde(default)]
    pub config_template: Option<PathBuf>,
    #[serde(default)]
    pub health: Option<HealthConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HealthConfig {
    #[serde(default)]
    pub kind: HealthKind,
    #[serde(default)]
    pub host: Option<String>,
    /// Defaults to the service port.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthKind {
    None,
    #[default]
    Port,
    Http,
}

impl Config {
    pub fn network(&self) -> &str {
        self.network.as_deref().unwrap_or(DEFAULT_NETWORK)
    }

    pub fn project(&self) -> &str {
        self.infra
            .as_ref()
            .and_then(|infra| infra.project.as_deref())
            .or(self.name.as_deref())
            .unwrap_or("devstack")
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|svc| svc.name == name)
    }

    /// Ports the stack expects to own, in service order.
    pub fn expected_ports(&self) -> Vec<u16> {
        self.services.iter().filter_map(|svc| svc.port).collect()
    }

    /// Resolve the state directory: explicit flag, then `DEVSTACK_STATE_DIR`,
    /// then the config file, then the platform state dir.
    pub fn state_dir(&self, flag: Option<&Path>) -> PathBuf {
        if let Some(dir) = flag {
            return dir.to_path_buf();
        }
        if let Some(dir) = std::env::var_os(STATE_DIR_ENV).filter(|v| !v.is_empty()) {
            return PathBuf::from(dir);
        }
        if let Some(dir) = self.state_dir.as_deref() {
            return resolve_relative(&self.root, expand_path(dir));
        }
        default_state_dir()
    }
}

pub fn default_state_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(|| dirs::home_dir().map(|home| home.join(".local/state")))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("devstack")
}

/// Layout of the state directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn pids(&self) -> PathBuf {
        self.root.join("pids")
    }

    pub fn logs(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn configs(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn log_file(&self, name: &str) -> PathBuf {
        self.logs().join(format!("{name}.log"))
    }

    pub fn config_file(&self, name: &str) -> PathBuf {
        self.configs().join(format!("{name}.yaml"))
    }
}

pub fn expand_path(raw: &str) -> PathBuf {
    let tilde_expanded = tilde(raw).into_owned();
    let env_expanded = match shellexpand::env(&tilde_expanded) {
        Ok(val) => val.into_owned(),
        Err(_) => tilde_expanded,
    };
    PathBuf::from(env_expanded)
}

fn resolve_relative(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn expand_relative(base: &Path, path: &Path) -> PathBuf {
    resolve_relative(base, expand_path(&path.to_string_lossy()))
}

/// Walk up from `start` looking for `devstack.toml`.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .find(|candidate| candidate.is_file())
}

pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let mut visited = Vec::new();
    let mut cfg = load_with_includes(path, &mut visited)?;
    cfg.root = path
        .canonicalize()
        .ok()
        .and_then(|p| p.parent().map(Path::to_path_buf))
        .unwrap_or_default();
    validate(&cfg)?;
    Ok(cfg)
}

fn load_with_includes(path: &Path, visited: &mut Vec<PathBuf>) -> Result<Config> {
    let canonical = path
        .canonicalize()
        .with_context(|| format!("failed to resolve path {}", path.display()))?;
    if visited.contains(&canonical) {
        bail!(
            "cycle detected while loading config includes: {}",
            path.display()
        );
    }
    visited.push(canonical.clone());

    let contents = fs::read_to_string(&canonical)
        .with_context(|| format!("failed to read config at {}", path.display()))?;
    let mut cfg: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config at {}", path.display()))?;

    let base = canonical.parent().unwrap_or(Path::new("/")).to_path_buf();
    resolve_paths(&mut cfg, &base);

    for include in cfg.include.clone() {
        let include_path = resolve_relative(&base, expand_path(&include));
        tracing::debug!(path = %include_path.display(), "loading included config");
        let included = load_with_includes(&include_path, visited)
            .with_context(|| format!("failed to load include {}", include_path.display()))?;
        merge_config(&mut cfg, included);
    }

    visited.pop();
    Ok(cfg)
}

/// Anchor every relative path in `cfg` to the file it was declared in.
fn resolve_paths(cfg: &mut Config, base: &Path) {
    if let Some(infra) = cfg.infra.as_mut() {
        infra.compose_file = expand_relative(base, &infra.compose_file);
    }
    for svc in &mut cfg.services {
        svc.repo = expand_relative(base, &svc.repo);
        svc.binary = expand_relative(&svc.repo, &svc.binary);
        if let Some(template) = svc.config_template.as_mut() {
            *template = expand_relative(base, template);
        }
    }
}

fn merge_config(base: &mut Config, other: Config) {
    if base.name.is_none() {
        base.name = other.name;
    }
    if base.network.is_none() {
        base.network = other.network;
    }
    if base.infra.is_none() {
        base.infra = other.infra;
    }
    for svc in other.services {
        if base.service(&svc.name).is_some() {
            tracing::debug!(name = %svc.name, "service already defined; ignoring include");
            continue;
        }
        base.services.push(svc);
    }
}

fn validate(cfg: &Config) -> Result<()> {
    let mut seen = HashSet::new();
    for svc in &cfg.services {
        if svc.name.trim().is_empty() {
            bail!("service with binary {} has an empty name", svc.binary.display());
        }
        if svc.name.contains(['/', '\\']) {
            bail!("service name '{}' must not contain path separators", svc.name);
        }
        if !seen.insert(svc.name.as_str()) {
            bail!("service '{}' is defined more than once", svc.name);
        }
    }
    let mut ports = HashSet::new();
    for port in cfg.expected_ports() {
        if !ports.insert(port) {
            bail!("port {port} is assigned to more than one service");
        }
    }
    Ok(())
}
