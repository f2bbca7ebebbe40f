//! Batch status polling under one shared deadline, used to watch GitHub
//! workflow runs while a release is in flight.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Finished; carries the reported conclusion.
    Completed(String),
    /// The probe itself failed for this target.
    Failed(String),
    TimedOut,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed(conclusion) if conclusion == "success")
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunOutcome::Completed(conclusion) => write!(f, "completed ({conclusion})"),
            RunOutcome::Failed(err) => write!(f, "probe failed: {err}"),
            RunOutcome::TimedOut => f.write_str("timed out"),
        }
    }
}

#[async_trait]
pub trait RunProbe: Send + Sync {
    /// `Ok(None)` while the target is still in progress.
    async fn poll(&self, id: &str) -> Result<Option<String>>;
}

/// Poll every target independently until each finishes or `deadline` passes.
///
/// Targets still unfinished at the deadline are reported as timed out.
pub async fn poll_all(
    targets: Vec<String>,
    deadline: Duration,
    interval: Duration,
    probe: Arc<dyn RunProbe>,
) -> BTreeMap<String, RunOutcome> {
    let results = Arc::new(Mutex::new(BTreeMap::new()));

    let handles: Vec<_> = targets
        .iter()
        .cloned()
        .map(|id| {
            let results = Arc::clone(&results);
            let probe = Arc::clone(&probe);
            tokio::spawn(async move {
                let outcome = loop {
                    match probe.poll(&id).await {
                        Ok(Some(conclusion)) => break RunOutcome::Completed(conclusion),
                        Ok(None) => debug!(%id, "still running"),
                        Err(err) => break RunOutcome::Failed(format!("{err:#}")),
                    }
                    tokio::time::sleep(interval).await;
                };
                results.lock().await.insert(id, outcome);
            })
        })
        .collect();

    let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
    if tokio::time::timeout(deadline, futures::future::join_all(handles))
        .await
        .is_err()
    {
        for abort in aborts {
            abort.abort();
        }
    }

    let mut results = results.lock().await;
    for id in targets {
        results.entry(id).or_insert(RunOutcome::TimedOut);
    }
    std::mem::take(&mut *results)
}

/// `gh run view <id> --repo <repo> --json status,conclusion`.
#[derive(Debug, Clone)]
pub struct GhRunProbe {
    pub repo: String,
}

impl GhRunProbe {
    pub fn new(repo: impl Into<String>) -> Result<Self> {
        which::which("gh").context("GitHub CLI (gh) is not installed")?;
        Ok(Self { repo: repo.into() })
    }
}

#[derive(Debug, Deserialize)]
struct RunView {
    status: String,
    #[serde(default)]
    conclusion: Option<String>,
}

fn parse_run_view(raw: &[u8]) -> Result<Option<String>> {
    let view: RunView = serde_json::from_slice(raw).context("unexpected gh run view output")?;
    if view.status != "completed" {
        return Ok(None);
    }
    Ok(Some(
        view.conclusion
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| "unknown".to_string()),
    ))
}

#[async_trait]
impl RunProbe for GhRunProbe {
    async fn poll(&self, id: &str) -> Result<Option<String>> {
        let output = Command::new("gh")
            .args(["run", "view", id, "--repo", &self.repo, "--json", "status,conclusion"])
            .output()
            .await
            .context("failed to run gh run view")?;
        if !output.status.success() {
            bail!(
                "gh run view {id} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        parse_run_view(&output.stdout)
    }
}
