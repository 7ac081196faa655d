//! Readiness prober.
//!
//! Polls HTTP(S) endpoints until the body contains an expected substring,
//! and polls TCP ports until they stop accepting connections.

use startstop_core::ProbeUrl;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Body excerpt kept for diagnostics.
const MAX_BODY_EXCERPT: usize = 2048;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error(
        "{url} did not serve {expected:?} within {elapsed_ms}ms; last response: {}",
        last_body.as_deref().unwrap_or("<none>")
    )]
    Timeout {
        url: String,
        expected: String,
        elapsed_ms: u64,
        last_body: Option<String>,
    },
}

pub type Result<T> = std::result::Result<T, ProbeError>;

#[derive(Debug, Clone)]
pub struct ProberConfig {
    pub connect_timeout: Duration,
    /// Upper bound for one request, further capped by the remaining budget.
    pub request_timeout: Duration,
    pub poll_interval: Duration,
    pub port_poll_interval: Duration,
    /// Accept self-signed certificates. Test-only relaxation.
    pub accept_invalid_certs: bool,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_millis(100),
            port_poll_interval: Duration::from_secs(1),
            accept_invalid_certs: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Prober {
    http: reqwest::Client,
    config: ProberConfig,
}

impl Prober {
    pub fn new(config: ProberConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()?;
        Ok(Self { http, config })
    }

    /// One GET; `None` when the request failed.
    async fn fetch(&self, url: &str, budget: Duration) -> Option<String> {
        let attempt = async {
            let response = self.http.get(url).send().await?;
            response.text().await
        };
        match tokio::time::timeout(budget, attempt).await {
            Ok(Ok(body)) => Some(body),
            Ok(Err(err)) => {
                debug!(url, error = %err, "probe attempt failed");
                None
            }
            Err(_) => {
                debug!(url, "probe attempt timed out");
                None
            }
        }
    }

    /// Poll `url` until its body contains `expected`.
    ///
    /// Returns the milliseconds from the first attempt to success when
    /// `measure_latency` is set.
    pub async fn wait_for_content(
        &self,
        url: &str,
        timeout: Duration,
        expected: &str,
        measure_latency: bool,
    ) -> Result<Option<u64>> {
        let started = Instant::now();
        let mut last_body: Option<String> = None;
        let mut attempts = 0u32;

        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(ProbeError::Timeout {
                    url: url.to_string(),
                    expected: expected.to_string(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    last_body: last_body.map(|b| excerpt(&b)),
                });
            }

            attempts += 1;
            if let Some(body) = self
                .fetch(url, self.config.request_timeout.min(remaining))
                .await
            {
                if body.contains(expected) {
                    // Sub-millisecond successes count as 1ms.
                    let elapsed_ms = (started.elapsed().as_millis() as u64).max(1);
                    info!(url, elapsed_ms, attempts, "expected content served");
                    return Ok(measure_latency.then_some(elapsed_ms));
                }
                last_body = Some(body);
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            tokio::time::sleep(self.config.poll_interval.min(remaining)).await;
        }
    }

    /// Check additional URLs without timing; each gets the full `timeout`.
    pub async fn probe_all(
        &self,
        base_url: &str,
        urls: &[ProbeUrl],
        timeout: Duration,
    ) -> Result<()> {
        for probe in urls {
            let url = join_url(base_url, &probe.path);
            self.wait_for_content(&url, timeout, &probe.expected, false)
                .await?;
        }
        Ok(())
    }

    /// Poll until `host:port` refuses or resets connections. `false` when
    /// that was never observed within `timeout`.
    pub async fn wait_for_port_closed(&self, host: &str, port: u16, timeout: Duration) -> bool {
        let started = Instant::now();
        loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            let attempt = self.config.connect_timeout.min(remaining.max(Duration::from_millis(1)));
            match tokio::time::timeout(attempt, TcpStream::connect((host, port))).await {
                Ok(Ok(mut stream)) => {
                    let _ = stream.shutdown().await;
                    debug!(host, port, "port still open");
                }
                Ok(Err(err)) if is_closed(&err) => {
                    debug!(host, port, error = %err, "port closed");
                    return true;
                }
                Ok(Err(err)) => debug!(host, port, error = %err, "connect attempt inconclusive"),
                Err(_) => debug!(host, port, "connect attempt timed out"),
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(self.config.port_poll_interval.min(remaining)).await;
        }
    }
}

/// Only a refusal or reset proves nothing is listening any more.
fn is_closed(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::ConnectionReset
    )
}

/// `base` + `path` with exactly one slash between them.
pub fn join_url(base: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

fn excerpt(body: &str) -> String {
    if body.len() <= MAX_BODY_EXCERPT {
        return body.to_string();
    }
    let mut end = MAX_BODY_EXCERPT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
