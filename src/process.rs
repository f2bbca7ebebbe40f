//! Signal delivery for supervised processes.

use std::io;

#[cfg(not(unix))]
use std::process::{Command, Stdio};

/// Signals the supervisor sends to managed processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ask the process to shut down (SIGTERM).
    Terminate,
    /// Kill without giving the process a chance to clean up (SIGKILL).
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Which processes a signal reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Only the pid itself.
    Process,
    /// Every member of the process group led by the pid.
    Group,
}

/// Delivers signals to managed processes.
pub trait Signaller: Send + Sync {
    fn send(&self, pid: u32, scope: Scope, signal: Signal) -> io::Result<()>;
}

/// Signals through the operating system.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsSignaller;

impl Signaller for OsSignaller {
    fn send(&self, pid: u32, scope: Scope, signal: Signal) -> io::Result<()> {
        match scope {
            Scope::Process => send_signal(pid, signal),
            Scope::Group => send_group_signal(pid, signal),
        }
    }
}

/// Check if a process is alive using a zero-effect signal probe.
#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    let Some(raw) = raw_pid(pid) else {
        return false;
    };
    if unsafe { libc::kill(raw, 0) } == 0 {
        return true;
    }
    // EPERM: the pid exists but belongs to another user.
    io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    Command::new("tasklist")
        .args(["/FI", &format!("PID eq {pid}"), "/NH"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

/// True when `pid` leads its own process group.
#[cfg(unix)]
pub fn is_group_leader(pid: u32) -> bool {
    raw_pid(pid).is_some_and(|raw| unsafe { libc::getpgid(raw) } == raw)
}

#[cfg(not(unix))]
pub fn is_group_leader(_pid: u32) -> bool {
    false
}

/// Send `signal` to `pid`. A pid that is already gone reports `NotFound`.
#[cfg(unix)]
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let raw = checked_pid(pid)?;
    kill_result(unsafe { libc::kill(raw, signal.as_raw()) })
}

/// Send `signal` to the process group `pgid`. An empty group reports `NotFound`.
#[cfg(unix)]
pub fn send_group_signal(pgid: u32, signal: Signal) -> io::Result<()> {
    let raw = checked_pid(pgid)?;
    kill_result(unsafe { libc::killpg(raw, signal.as_raw()) })
}

#[cfg(unix)]
fn checked_pid(pid: u32) -> io::Result<libc::pid_t> {
    raw_pid(pid).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        )
    })
}

#[cfg(unix)]
fn kill_result(ret: libc::c_int) -> io::Result<()> {
    if ret == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Err(io::Error::new(io::ErrorKind::NotFound, err));
    }
    Err(err)
}

#[cfg(not(unix))]
pub fn send_signal(pid: u32, signal: Signal) -> io::Result<()> {
    let mut cmd = Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T"]);
    if signal == Signal::Kill {
        cmd.arg("/F");
    }
    let status = cmd.stdout(Stdio::null()).stderr(Stdio::null()).status()?;
    if status.success() {
        Ok(())
    } else {
        Err(io::Error::other(format!(
            "taskkill exited with status {}",
            status.code().unwrap_or(-1)
        )))
    }
}

/// `taskkill /T` already walks the process tree.
#[cfg(not(unix))]
pub fn send_group_signal(pgid: u32, signal: Signal) -> io::Result<()> {
    send_signal(pgid, signal)
}

/// Gone or a zombie nobody has reaped yet. Orphaned grandchildren are
/// reparented to an init that may reap them late, so tests check this
/// instead of bare liveness.
#[cfg(all(test, unix))]
pub(crate) fn is_defunct(pid: u32) -> bool {
    if !process_alive(pid) {
        return true;
    }
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let (_, rest) = stat.rsplit_once(')')?;
            rest.trim_start().chars().next()
        })
        .is_some_and(|state| state == 'Z' || state == 'X')
}

/// Pids 0 and negatives address process groups; never signal those by accident.
#[cfg(unix)]
fn raw_pid(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|raw| *raw > 0)
}
