//! Backend warm-up gate
//!
//! Before a route is published the backend is probed until it answers
//! HTTP, so the mesh never sends users to a server that is still booting.

use crate::route::Target;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

/// Upper bound on a single probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Outcome of waiting for a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    TimedOut,
}

/// Polls targets until they answer or a deadline passes
#[derive(Debug, Clone)]
pub struct WarmupGate {
    enabled: bool,
    interval: Duration,
    max_interval: Duration,
    timeout: Duration,
}

impl WarmupGate {
    pub fn new(enabled: bool, interval: Duration, max_interval: Duration) -> Self {
        Self {
            enabled,
            interval,
            max_interval: max_interval.max(interval),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Deadline used by callers that do not pass their own
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// A gate that reports every target ready immediately
    pub fn disabled() -> Self {
        Self::new(false, Duration::from_millis(250), Duration::from_secs(2))
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn next_interval(&self, interval: Duration) -> Duration {
        interval.saturating_mul(2).min(self.max_interval)
    }

    /// Wait until `target` answers a `GET path` or `timeout` elapses
    ///
    /// The poll interval doubles after every failed probe up to the
    /// configured maximum.
    pub async fn wait_ready(&self, target: &Target, path: &str, timeout: Duration) -> Readiness {
        if !self.enabled {
            return Readiness::Ready;
        }

        let poll = async {
            let mut interval = self.interval;
            let mut attempts = 0u32;
            loop {
                attempts += 1;
                if probe(target, path).await {
                    debug!(%target, attempts, "Backend answered warm-up probe");
                    return;
                }
                tokio::time::sleep(interval).await;
                interval = self.next_interval(interval);
            }
        };

        match tokio::time::timeout(timeout, poll).await {
            Ok(()) => Readiness::Ready,
            Err(_) => Readiness::TimedOut,
        }
    }
}

/// One HTTP probe; any status below 500 counts as ready
async fn probe(target: &Target, path: &str) -> bool {
    let addr = target.socket_addr();

    let mut stream = match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(&addr)).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!(%addr, error = %e, "Warm-up probe failed (connection error)");
            return false;
        }
        Err(_) => {
            debug!(%addr, "Warm-up probe failed (connect timeout)");
            return false;
        }
    };

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: routegate-warmup\r\nConnection: close\r\n\r\n",
        path, addr
    );
    if stream.write_all(request.as_bytes()).await.is_err() {
        return false;
    }

    let read_result = tokio::time::timeout(PROBE_TIMEOUT, async {
        let mut reader = BufReader::new(stream);
        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        Ok::<_, std::io::Error>(status_line)
    })
    .await;

    match read_result {
        // Format: "HTTP/1.1 302 Found\r\n"
        Ok(Ok(status_line)) => {
            let status = status_line
                .split_whitespace()
                .nth(1)
                .and_then(|code| code.parse::<u16>().ok());
            debug!(%addr, ?status, "Warm-up probe response");
            matches!(status, Some(code) if code < 500)
        }
        _ => false,
    }
}
