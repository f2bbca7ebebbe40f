//! Graceful-then-forced termination.
//!
//! A stop sends SIGTERM, then polls liveness until the process is gone or the
//! grace window closes, at which point it escalates to SIGKILL. Running out
//! of grace is not a failure; cancelling the caller's token is, and it
//! escalates immediately.

use std::io;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SupervisorError;
use crate::process::{self, Scope, Signal, Signaller};

/// How long to wait for SIGKILL to take effect before giving up on observing it.
const KILL_SETTLE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    pub grace: Duration,
    pub poll_interval: Duration,
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_secs(10),
            poll_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing to do; the process was already gone.
    AlreadyExited,
    /// Exited within the grace window after SIGTERM.
    Graceful,
    /// Ignored SIGTERM for the whole grace window and was killed.
    Forced,
}

/// Exit notification published by a watcher task, if the process has one.
pub type ExitFlag = watch::Receiver<bool>;

fn is_gone(pid: u32, exited: Option<&ExitFlag>) -> bool {
    if exited.is_some_and(|flag| *flag.borrow()) {
        return true;
    }
    !process::process_alive(pid)
}

/// The process being stopped and how to reach it.
#[derive(Clone, Copy)]
pub struct Target<'a> {
    pub pid: u32,
    pub scope: Scope,
    pub exited: Option<&'a ExitFlag>,
}

fn force_kill(signaller: &dyn Signaller, target: Target<'_>) -> Result<(), SupervisorError> {
    let pid = target.pid;
    match signaller.send(pid, target.scope, Signal::Kill) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(SupervisorError::Signal { pid, source }),
    }
}

/// Kill group members that outlived their leader.
fn sweep_group(signaller: &dyn Signaller, target: Target<'_>) {
    if target.scope != Scope::Group {
        return;
    }
    match signaller.send(target.pid, Scope::Group, Signal::Kill) {
        Ok(()) => debug!(pgid = target.pid, "killed leftover group members"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(pgid = target.pid, error = %err, "failed to sweep process group"),
    }
}

/// Terminate `target`, escalating to SIGKILL after `policy.grace`.
///
/// Liveness is judged on the leader pid alone; with [`Scope::Group`] every
/// signal goes to the whole group.
pub async fn terminate(
    signaller: &dyn Signaller,
    target: Target<'_>,
    policy: ShutdownPolicy,
    cancel: &CancellationToken,
) -> Result<StopOutcome, SupervisorError> {
    let Target { pid, exited, .. } = target;
    if is_gone(pid, exited) {
        sweep_group(signaller, target);
        return Ok(StopOutcome::AlreadyExited);
    }

    match signaller.send(pid, target.scope, Signal::Terminate) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(StopOutcome::AlreadyExited),
        Err(source) => return Err(SupervisorError::Signal { pid, source }),
    }
    debug!(pid, scope = ?target.scope, "sent SIGTERM");

    let deadline = Instant::now() + policy.grace;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                warn!(pid, "stop cancelled; killing immediately");
                force_kill(signaller, target)?;
                return Err(SupervisorError::Cancelled);
            }
            _ = tokio::time::sleep(policy.poll_interval) => {}
        }
        if is_gone(pid, exited) {
            sweep_group(signaller, target);
            return Ok(StopOutcome::Graceful);
        }
        if Instant::now() >= deadline {
            break;
        }
    }

    warn!(pid, grace = ?policy.grace, "graceful shutdown window elapsed; sending SIGKILL");
    force_kill(signaller, target)?;

    let settle_deadline = Instant::now() + KILL_SETTLE;
    while !is_gone(pid, exited) && Instant::now() < settle_deadline {
        tokio::time::sleep(policy.poll_interval).await;
    }
    Ok(StopOutcome::Forced)
}
