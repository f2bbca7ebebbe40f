//! Readiness probes used to gate `Supervisor::start`.
//!
//! A checker runs once, right after the process is spawned. It is not a
//! liveness monitor: after start returns, only the exit watcher observes the
//! process.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{HealthConfig, HealthKind};

pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("{target} not ready after {elapsed:?}")]
    Timeout { target: String, elapsed: Duration },
    #[error("health check cancelled")]
    Cancelled,
    #[error("failed to build http client")]
    Client(#[source] reqwest::Error),
}

#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Resolve once the target is ready, the timeout elapses, or `cancel` fires.
    async fn check(&self, cancel: &CancellationToken) -> Result<(), HealthError>;

    fn name(&self) -> String;
}

/// Always ready. Used when a service has no health configuration.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopChecker;

#[async_trait]
impl HealthChecker for NoopChecker {
    async fn check(&self, _cancel: &CancellationToken) -> Result<(), HealthError> {
        Ok(())
    }

    fn name(&self) -> String {
        "noop".to_string()
    }
}

/// Ready once a TCP connect to `host:port` succeeds.
#[derive(Debug, Clone)]
pub struct PortChecker {
    pub host: String,
    pub port: u16,
    pub timeout: Duration,
    pub interval: Duration,
}

impl PortChecker {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl HealthChecker for PortChecker {
    async fn check(&self, cancel: &CancellationToken) -> Result<(), HealthError> {
        let target = self.target();
        let attempt_timeout = self.interval.max(Duration::from_millis(250));
        retry_until_ready(cancel, &target, self.timeout, self.interval, || {
            let target = target.clone();
            async move {
                match tokio::time::timeout(attempt_timeout, TcpStream::connect(&target)).await {
                    Ok(Ok(_stream)) => true,
                    Ok(Err(err)) => {
                        debug!(%target, error = %err, "port not accepting connections yet");
                        false
                    }
                    Err(_) => false,
                }
            }
        })
        .await
    }

    fn name(&self) -> String {
        format!("port({})", self.target())
    }
}

/// Ready once `GET url` answers with status 200.
#[derive(Debug, Clone)]
pub struct HttpChecker {
    pub url: String,
    pub timeout: Duration,
    pub interval: Duration,
}

impl HttpChecker {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

#[async_trait]
impl HealthChecker for HttpChecker {
    async fn check(&self, cancel: &CancellationToken) -> Result<(), HealthError> {
        let client = reqwest::Client::builder()
            .timeout(self.interval.max(Duration::from_secs(1)))
            .build()
            .map_err(HealthError::Client)?;

        retry_until_ready(cancel, &self.url, self.timeout, self.interval, || {
            let request = client.get(&self.url);
            async move {
                match request.send().await {
                    Ok(resp) if resp.status() == reqwest::StatusCode::OK => true,
                    Ok(resp) => {
                        debug!(status = %resp.status(), "health endpoint not ready yet");
                        false
                    }
                    Err(err) => {
                        debug!(error = %err, "health endpoint unreachable");
                        false
                    }
                }
            }
        })
        .await
    }

    fn name(&self) -> String {
        format!("http({})", self.url)
    }
}

/// Build the checker described by a service's `[service.health]` table.
pub fn checker_for(cfg: Option<&HealthConfig>, service_port: Option<u16>) -> Box<dyn HealthChecker> {
    let Some(cfg) = cfg else {
        return Box::new(NoopChecker);
    };
    let timeout = cfg
        .timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_TIMEOUT);
    let interval = cfg
        .interval_ms
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_INTERVAL);

    match cfg.kind {
        HealthKind::None => Box::new(NoopChecker),
        HealthKind::Port => match cfg.port.or(service_port) {
            Some(port) => Box::new(
                PortChecker::new(cfg.host.as_deref().unwrap_or("127.0.0.1"), port)
                    .with_timeout(timeout)
                    .with_interval(interval),
            ),
            None => {
                tracing::warn!("port health check configured without a port; skipping");
                Box::new(NoopChecker)
            }
        },
        HealthKind::Http => match cfg.url.as_deref() {
            Some(url) => Box::new(
                HttpChecker::new(url)
                    .with_timeout(timeout)
                    .with_interval(interval),
            ),
            None => {
                tracing::warn!("http health check configured without a url; skipping");
                Box::new(NoopChecker)
            }
        },
    }
}

async fn retry_until_ready<F, Fut>(
    cancel: &CancellationToken,
    target: &str,
    timeout: Duration,
    interval: Duration,
    mut probe: F,
) -> Result<(), HealthError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = Instant::now();
    loop {
        let ready = tokio::select! {
            _ = cancel.cancelled() => return Err(HealthError::Cancelled),
            ready = probe() => ready,
        };
        if ready {
            debug!(%target, elapsed = ?started.elapsed(), "target ready");
            return Ok(());
        }

        let elapsed = started.elapsed();
        if elapsed >= timeout {
            return Err(HealthError::Timeout {
                target: target.to_string(),
                elapsed,
            });
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(HealthError::Cancelled),
            _ = tokio::time::sleep(interval.min(timeout - elapsed)) => {}
        }
    }
}
