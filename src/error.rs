use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::health::HealthError;

/// Failures surfaced by the process supervisor.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("process '{0}' is not managed by this supervisor")]
    NotFound(String),
    #[error("process '{0}' is already running")]
    AlreadyRunning(String),
    #[error("failed to spawn '{name}' from {}", binary.display())]
    Spawn {
        name: String,
        binary: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to prepare log file {}", path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("health check {checker} failed for '{name}'")]
    HealthCheck {
        name: String,
        checker: String,
        #[source]
        source: HealthError,
    },
    #[error("cannot {operation} '{name}': {reason}")]
    Unsupported {
        operation: &'static str,
        name: String,
        reason: &'static str,
    },
    #[error("failed to signal pid {pid}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("operation cancelled")]
    Cancelled,
    #[error(transparent)]
    PartialBatch(#[from] BatchFailure),
}

impl SupervisorError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, SupervisorError::NotFound(_))
    }
}

/// Per-item failures collected by a best-effort sweep.
#[derive(Debug, Default)]
pub struct BatchFailure {
    pub attempted: usize,
    pub failures: Vec<(String, String)>,
}

impl BatchFailure {
    pub fn new(attempted: usize) -> Self {
        Self {
            attempted,
            failures: Vec::new(),
        }
    }

    pub fn record(&mut self, name: impl Into<String>, err: impl fmt::Display) {
        self.failures.push((name.into(), format!("{err:#}")));
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<(), BatchFailure> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} operations failed",
            self.failures.len(),
            self.attempted
        )?;
        for (name, err) in &self.failures {
            write!(f, "; {name}: {err}")?;
        }
        Ok(())
    }
}

impl std::error::Error for BatchFailure {}
