//! In-memory table of managed processes.
//!
//! Each process started here gets a detached watcher task that waits for it
//! to exit, then deregisters it and deletes its record. Processes adopted from
//! records written by an earlier supervisor have no watcher and no spawn
//! handle; they can be stopped, listed and tailed, but not restarted.
//!
//! The table lock is only held for bookkeeping. Spawning, health polling,
//! shutdown polling and log streaming all happen outside it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio::io::AsyncWrite;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StateLayout;
use crate::error::{BatchFailure, SupervisorError};
use crate::health::{HealthChecker, HealthError};
use crate::logs;
use crate::pidfile::{PersistenceError, PidStore, ProcessRecord, RECORD_VERSION};
use crate::process::{self, OsSignaller, Scope, Signaller};
use crate::shutdown::{self, ExitFlag, ShutdownPolicy, StopOutcome, Target};

/// Everything needed to spawn (and later respawn) a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl SpawnSpec {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Snapshot of a managed process returned by queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: u32,
    pub log_file: PathBuf,
    pub started_at: DateTime<Utc>,
    pub command: PathBuf,
    pub args: Vec<String>,
    /// False for processes adopted from a previous supervisor run.
    pub restartable: bool,
}

struct ManagedProcess {
    info: ProcessInfo,
    spawn: Option<SpawnSpec>,
    exited: Option<ExitFlag>,
    scope: Scope,
}

impl ManagedProcess {
    fn target(&self) -> (u32, Scope, Option<ExitFlag>) {
        (self.info.pid, self.scope, self.exited.clone())
    }

    fn is_gone(&self) -> bool {
        match &self.exited {
            Some(flag) => *flag.borrow(),
            None => !process::process_alive(self.info.pid),
        }
    }
}

#[derive(Default)]
struct Table {
    live: HashMap<String, ManagedProcess>,
    /// Names with a Start in flight; closes the window between the
    /// AlreadyRunning check and registration.
    starting: HashSet<String>,
}

struct Inner {
    layout: StateLayout,
    store: PidStore,
    policy: ShutdownPolicy,
    signaller: Arc<dyn Signaller>,
    table: RwLock<Table>,
}

impl Inner {
    fn read(&self) -> RwLockReadGuard<'_, Table> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Table> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop `name` and its record if it still refers to `pid`. The record is
    /// removed under the table lock so a newer Start's record survives.
    fn release(&self, name: &str, pid: u32) -> bool {
        let mut table = self.write();
        if !table.live.get(name).is_some_and(|p| p.info.pid == pid) {
            return false;
        }
        table.live.remove(name);
        self.forget_record(name);
        true
    }

    fn forget_record(&self, name: &str) {
        if let Err(err) = self.store.remove(name) {
            warn!(name, error = %err, "failed to delete process record");
        }
    }
}

/// Releases a Start reservation unless it was committed.
struct Reservation<'a> {
    inner: &'a Inner,
    name: &'a str,
    committed: bool,
}

impl<'a> Reservation<'a> {
    fn acquire(inner: &'a Inner, name: &'a str) -> Result<Self, SupervisorError> {
        let mut table = inner.write();
        if table.starting.contains(name) {
            return Err(SupervisorError::AlreadyRunning(name.to_string()));
        }
        if let Some(existing) = table.live.get(name) {
            if !existing.is_gone() {
                return Err(SupervisorError::AlreadyRunning(name.to_string()));
            }
            debug!(name, pid = existing.info.pid, "replacing exited entry");
            table.live.remove(name);
        }
        table.starting.insert(name.to_string());
        Ok(Self {
            inner,
            name,
            committed: false,
        })
    }

    fn commit(mut self, entry: ManagedProcess, record: &ProcessRecord) {
        let mut table = self.inner.write();
        if let Err(err) = self.inner.store.save(self.name, record) {
            warn!(name = self.name, pid = record.pid, error = %err, "failed to persist process record");
        }
        table.starting.remove(self.name);
        table.live.insert(self.name.to_string(), entry);
        self.committed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.inner.write().starting.remove(self.name);
        }
    }
}

/// Owns the lifecycle of every managed process for one state directory.
///
/// Only one supervisor may own a state directory at a time.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    /// Open the state directory and adopt every live process recorded there.
    pub fn open(layout: StateLayout, policy: ShutdownPolicy) -> Result<Self, PersistenceError> {
        Self::with_signaller(layout, policy, Arc::new(OsSignaller))
    }

    /// Like [`Supervisor::open`], delivering signals through `signaller`.
    pub fn with_signaller(
        layout: StateLayout,
        policy: ShutdownPolicy,
        signaller: Arc<dyn Signaller>,
    ) -> Result<Self, PersistenceError> {
        let store = PidStore::new(layout.pids());
        store.ensure_dir()?;
        let logs_dir = layout.logs();
        std::fs::create_dir_all(&logs_dir).map_err(|source| PersistenceError::Io {
            path: logs_dir,
            source,
        })?;

        let supervisor = Self {
            inner: Arc::new(Inner {
                layout,
                store,
                policy,
                signaller,
                table: RwLock::new(Table::default()),
            }),
        };
        supervisor.recover();
        Ok(supervisor)
    }

    pub fn layout(&self) -> &StateLayout {
        &self.inner.layout
    }

    pub fn policy(&self) -> ShutdownPolicy {
        self.inner.policy
    }

    /// Adopt live records not already in memory; delete corrupt and stale ones.
    /// Returns the names adopted.
    pub fn recover(&self) -> Vec<String> {
        let names = match self.inner.store.names() {
            Ok(names) => names,
            Err(err) => {
                warn!(error = %err, "failed to scan process records");
                return Vec::new();
            }
        };

        let mut adopted = Vec::new();
        for name in names {
            {
                let table = self.inner.read();
                if table.live.contains_key(&name) || table.starting.contains(&name) {
                    continue;
                }
            }
            if self.adopt(&name) {
                adopted.push(name);
            }
        }
        adopted
    }

    fn adopt(&self, name: &str) -> bool {
        let record = match self.inner.store.load(name) {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(err @ PersistenceError::Corrupt { .. }) => {
                warn!(name, error = %err, "deleting corrupt process record");
                self.inner.forget_record(name);
                return false;
            }
            Err(err) => {
                warn!(name, error = %err, "failed to read process record");
                return false;
            }
        };

        if record.version != RECORD_VERSION {
            warn!(
                name,
                version = record.version,
                expected = RECORD_VERSION,
                "process record has an unrecognized version"
            );
        }
        if !process::process_alive(record.pid) {
            info!(name, pid = record.pid, "removing stale process record");
            self.inner.forget_record(name);
            return false;
        }

        // Children spawned by an earlier supervisor lead their own group.
        let scope = if process::is_group_leader(record.pid) {
            Scope::Group
        } else {
            Scope::Process
        };
        let entry = ManagedProcess {
            info: ProcessInfo {
                name: name.to_string(),
                pid: record.pid,
                log_file: record.log_file,
                started_at: record.started_at,
                command: record.command,
                args: record.args,
                restartable: false,
            },
            spawn: None,
            exited: None,
            scope,
        };
        let mut table = self.inner.write();
        if table.live.contains_key(name) || table.starting.contains(name) {
            return false;
        }
        info!(name, pid = entry.info.pid, "adopted running process");
        table.live.insert(name.to_string(), entry);
        true
    }

    /// Spawn `name`, gate on `checker`, and hand it to a watcher task.
    pub async fn start(
        &self,
        cancel: &CancellationToken,
        name: &str,
        spec: SpawnSpec,
        checker: Option<&dyn HealthChecker>,
    ) -> Result<ProcessInfo, SupervisorError> {
        let reservation = Reservation::acquire(&self.inner, name)?;

        let log_file = self.inner.layout.log_file(name);
        let (stdout, stderr) = open_log(&log_file)?;

        let mut cmd = Command::new(&spec.binary);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        let scope = if cfg!(unix) { Scope::Group } else { Scope::Process };

        let spawn_error = |source: std::io::Error| SupervisorError::Spawn {
            name: name.to_string(),
            binary: spec.binary.clone(),
            source,
        };
        let child = cmd.spawn().map_err(spawn_error)?;
        let pid = child
            .id()
            .ok_or_else(|| spawn_error(std::io::Error::other("process exited before reporting a pid")))?;

        let (exit_tx, exit_rx) = watch::channel(false);
        let info = ProcessInfo {
            name: name.to_string(),
            pid,
            log_file: log_file.clone(),
            started_at: Utc::now(),
            command: spec.binary.clone(),
            args: spec.args.clone(),
            restartable: true,
        };
        let record = ProcessRecord::new(
            pid,
            log_file,
            spec.binary.clone(),
            spec.args.clone(),
            info.started_at,
        );
        reservation.commit(
            ManagedProcess {
                info: info.clone(),
                spawn: Some(spec),
                exited: Some(exit_rx),
                scope,
            },
            &record,
        );
        info!(name, pid, "started process");

        tokio::spawn(watch_exit(
            Arc::clone(&self.inner),
            name.to_string(),
            pid,
            child,
            exit_tx,
        ));

        let Some(checker) = checker else {
            return Ok(info);
        };
        match checker.check(cancel).await {
            Ok(()) => {
                debug!(name, checker = %checker.name(), "health check passed");
                Ok(info)
            }
            Err(err) => {
                warn!(name, pid, checker = %checker.name(), error = %err, "health check failed; stopping");
                self.discard(cancel, name, pid).await;
                if matches!(err, HealthError::Cancelled) {
                    return Err(SupervisorError::Cancelled);
                }
                Err(SupervisorError::HealthCheck {
                    name: name.to_string(),
                    checker: checker.name(),
                    source: err,
                })
            }
        }
    }

    /// Tear down a process that failed its start gate. A fired token
    /// escalates straight to SIGKILL.
    async fn discard(&self, cancel: &CancellationToken, name: &str, pid: u32) {
        let (scope, exited) = match self.inner.read().live.get(name) {
            Some(entry) if entry.info.pid == pid => (entry.scope, entry.exited.clone()),
            _ => (Scope::Process, None),
        };
        let target = Target {
            pid,
            scope,
            exited: exited.as_ref(),
        };
        let outcome =
            shutdown::terminate(self.inner.signaller.as_ref(), target, self.inner.policy, cancel).await;
        match outcome {
            Ok(_) | Err(SupervisorError::Cancelled) => {}
            Err(err) => warn!(name, pid, error = %err, "failed to stop unhealthy process"),
        }
        self.inner.release(name, pid);
    }

    /// Stop `name`: SIGTERM, wait out the grace window, then SIGKILL.
    pub async fn stop(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<StopOutcome, SupervisorError> {
        let (pid, scope, exited) = self
            .inner
            .read()
            .live
            .get(name)
            .map(ManagedProcess::target)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        let target = Target {
            pid,
            scope,
            exited: exited.as_ref(),
        };
        let result =
            shutdown::terminate(self.inner.signaller.as_ref(), target, self.inner.policy, cancel).await;
        if matches!(result, Ok(_) | Err(SupervisorError::Cancelled)) {
            self.inner.release(name, pid);
        }
        if let Ok(outcome) = &result {
            info!(name, pid, ?outcome, "stopped process");
        }
        result
    }

    /// Stop every process, including live ones only known from disk.
    ///
    /// Newest processes are stopped first. Individual failures are collected;
    /// only cancellation ends the sweep early.
    pub async fn stop_all(&self, cancel: &CancellationToken) -> Result<(), SupervisorError> {
        self.recover();

        let mut targets = self.list();
        targets.sort_by(|a, b| b.started_at.cmp(&a.started_at));

        let mut batch = BatchFailure::new(targets.len());
        for target in targets {
            if cancel.is_cancelled() {
                return Err(SupervisorError::Cancelled);
            }
            match self.stop(cancel, &target.name).await {
                Ok(_) => {}
                Err(SupervisorError::NotFound(_)) => {
                    debug!(name = %target.name, "already gone before stop");
                }
                Err(SupervisorError::Cancelled) => return Err(SupervisorError::Cancelled),
                Err(err) => {
                    warn!(name = %target.name, error = %err, "failed to stop process");
                    batch.record(&target.name, err);
                }
            }
        }
        batch.into_result().map_err(SupervisorError::from)
    }

    /// Stop and respawn with the spawn spec it was started with; no health gate.
    pub async fn restart(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<ProcessInfo, SupervisorError> {
        let spec = {
            let table = self.inner.read();
            let entry = table
                .live
                .get(name)
                .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;
            entry.spawn.clone().ok_or(SupervisorError::Unsupported {
                operation: "restart",
                name: name.to_string(),
                reason: "it was adopted from a previous run and has no spawn handle",
            })?
        };

        self.stop(cancel, name).await?;
        self.start(cancel, name, spec, None).await
    }

    /// Every managed process, sorted by name.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let table = self.inner.read();
        let mut out: Vec<_> = table.live.values().map(|p| p.info.clone()).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn get(&self, name: &str) -> Option<ProcessInfo> {
        self.inner.read().live.get(name).map(|p| p.info.clone())
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inner
            .read()
            .live
            .get(name)
            .is_some_and(|p| !p.is_gone())
    }

    /// Write the log for `name` to `out`, once or until `cancel` fires.
    ///
    /// Works for names no longer running as long as their log file remains.
    pub async fn tail_logs<W>(
        &self,
        cancel: &CancellationToken,
        name: &str,
        follow: bool,
        out: &mut W,
    ) -> Result<(), SupervisorError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let path = self
            .get(name)
            .map(|info| info.log_file)
            .or_else(|| Some(self.inner.layout.log_file(name)).filter(|p| p.is_file()))
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))?;

        let result = if follow {
            logs::follow(&path, out, cancel, logs::FOLLOW_INTERVAL).await
        } else {
            logs::dump(&path, out).await.map(|_| ())
        };
        result.map_err(|source| SupervisorError::LogFile { path, source })
    }
}

/// Truncate the log and hand out one handle each for stdout and stderr.
fn open_log(path: &Path) -> Result<(File, File), SupervisorError> {
    let log_error = |source: std::io::Error| SupervisorError::LogFile {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(log_error)?;
    }
    let stdout = File::create(path).map_err(log_error)?;
    let stderr = stdout.try_clone().map_err(log_error)?;
    Ok((stdout, stderr))
}

async fn watch_exit(
    inner: Arc<Inner>,
    name: String,
    pid: u32,
    mut child: Child,
    exited: watch::Sender<bool>,
) {
    let status = child.wait().await;
    let _ = exited.send(true);

    inner.release(&name, pid);
    match status {
        Ok(status) if status.success() => info!(name, pid, "process exited cleanly"),
        Ok(status) => warn!(name, pid, %status, "process exited with failure"),
        Err(err) => warn!(name, pid, error = %err, "failed to wait for process"),
    }
}
