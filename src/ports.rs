//! TCP port pre-flight and orphan discovery.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::process::Command;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::process::{self, OsSignaller, Scope, Signal, Signaller};

/// How long a gracefully-signalled owner gets before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(3);

/// An occupied port and, when it could be resolved, the process holding it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConflict {
    pub port: u16,
    pub pid: Option<u32>,
    pub process: Option<String>,
}

impl fmt::Display for PortConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "port {} is in use", self.port)?;
        match (&self.process, self.pid) {
            (Some(name), Some(pid)) => write!(f, " by {name} (pid {pid})"),
            (None, Some(pid)) => write!(f, " by pid {pid}"),
            _ => Ok(()),
        }
    }
}

/// `None` when `port` is free. Binding is the source of truth; the owner is
/// looked up afterwards and may be missing.
///
/// Both the wildcard and loopback addresses are tried: with `SO_REUSEADDR`
/// some platforms let a wildcard bind succeed over a loopback-only listener.
pub fn check_port(port: u16) -> Option<PortConflict> {
    for addr in [Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST] {
        if let Err(err) = TcpListener::bind(SocketAddrV4::new(addr, port)) {
            debug!(port, %addr, error = %err, "port is occupied");
            let owner = find_owner(port);
            return Some(PortConflict {
                port,
                pid: owner.as_ref().map(|(pid, _)| *pid),
                process: owner.and_then(|(_, name)| name),
            });
        }
    }
    None
}

/// Conflicts among `ports`, in input order.
pub fn check_ports(ports: &[u16]) -> Vec<PortConflict> {
    ports.iter().filter_map(|&port| check_port(port)).collect()
}

/// SIGTERM `pid`, escalating to SIGKILL if it lingers or the SIGTERM
/// cannot be sent.
pub fn kill_process(pid: u32) -> std::io::Result<()> {
    kill_with(&OsSignaller, pid)
}

fn kill_with(signaller: &dyn Signaller, pid: u32) -> std::io::Result<()> {
    let force = || match signaller.send(pid, Scope::Process, Signal::Kill) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    };

    match signaller.send(pid, Scope::Process, Signal::Terminate) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            warn!(pid, error = %err, "SIGTERM failed; sending SIGKILL");
            return force();
        }
    }

    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if !process::process_alive(pid) {
            return Ok(());
        }
        std::thread::sleep(Duration::from_millis(100));
    }

    warn!(pid, "process ignored SIGTERM; sending SIGKILL");
    force()
}

/// Best-effort owner lookup through `lsof`.
fn find_owner(port: u16) -> Option<(u32, Option<String>)> {
    if which::which("lsof").is_err() {
        return None;
    }
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-Fpc"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    parse_lsof_fields(&String::from_utf8_lossy(&output.stdout))
}

/// Parse `lsof -F pc` output: `p<pid>` then `c<command>` per process.
fn parse_lsof_fields(text: &str) -> Option<(u32, Option<String>)> {
    let mut pid = None;
    let mut command = None;
    for line in text.lines() {
        if let Some(raw) = line.strip_prefix('p') {
            if pid.is_some() {
                break;
            }
            pid = raw.trim().parse().ok();
        } else if let Some(name) = line.strip_prefix('c') {
            if pid.is_some() && command.is_none() {
                command = Some(name.trim().to_string());
            }
        }
    }
    pid.map(|pid| (pid, command))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ephemeral_listener() -> (TcpListener, u16) {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        (listener, port)
    }

    #[test]
    fn bound_port_is_occupied_then_free_after_close() {
        let (listener, port) = ephemeral_listener();
        let conflict = check_port(port).expect("occupied while bound");
        assert_eq!(conflict.port, port);

        drop(listener);
        assert!(check_port(port).is_none());
    }

    #[test]
    fn loopback_only_listener_is_occupied() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).expect("bind");
        let port = listener.local_addr().expect("addr").port();
        assert_eq!(check_port(port).map(|c| c.port), Some(port));

        drop(listener);
        assert!(check_port(port).is_none());
    }

    #[test]
    fn check_ports_reports_only_occupied() {
        let (a, port_a) = ephemeral_listener();
        let (b, port_b) = ephemeral_listener();
        let (free, port_free) = ephemeral_listener();
        drop(free);

        let conflicts = check_ports(&[port_a, port_free, port_b]);
        let ports: Vec<_> = conflicts.iter().map(|c| c.port).collect();
        assert_eq!(ports, [port_a, port_b]);

        drop((a, b));
    }

    #[test]
    fn lsof_fields_parse_first_process() {
        let text = "p4242\ncnode\nf12\np7\ncother\n";
        assert_eq!(
            parse_lsof_fields(text),
            Some((4242, Some("node".to_string())))
        );
        assert_eq!(parse_lsof_fields(""), None);
    }

    #[test]
    fn conflict_display_includes_owner() {
        let conflict = PortConflict {
            port: 8080,
            pid: Some(12),
            process: Some("api".to_string()),
        };
        assert_eq!(conflict.to_string(), "port 8080 is in use by api (pid 12)");
    }

    #[cfg(unix)]
    #[test]
    fn kill_process_terminates_owner() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exec sleep 30"])
            .spawn()
            .expect("spawn");
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());

        kill_process(pid).expect("kill");
        let status = reaper.join().expect("join").expect("wait");
        assert!(!status.success());
    }
    /// Refuses SIGTERM, delivers everything else.
    #[cfg(unix)]
    struct NoTerm;

    #[cfg(unix)]
    impl Signaller for NoTerm {
        fn send(&self, pid: u32, scope: Scope, signal: Signal) -> std::io::Result<()> {
            if signal == Signal::Terminate {
                return Err(std::io::ErrorKind::PermissionDenied.into());
            }
            OsSignaller.send(pid, scope, signal)
        }
    }

    #[cfg(unix)]
    #[test]
    fn failed_sigterm_falls_back_to_sigkill() {
        let mut child = std::process::Command::new("/bin/sh")
            .args(["-c", "exec sleep 30"])
            .spawn()
            .expect("spawn");
        let pid = child.id();
        let reaper = std::thread::spawn(move || child.wait());

        let started = Instant::now();
        kill_with(&NoTerm, pid).expect("kill");
        assert!(started.elapsed() < KILL_GRACE);
        let status = reaper.join().expect("join").expect("wait");
        assert!(!status.success());
    }
}
