//! Memoized gateway health probing.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::Instant;

/// Remembers the last probe outcome and decides when a new probe is due.
#[derive(Debug, Clone)]
pub struct HealthMemo {
    last_checked: Option<Instant>,
    healthy: bool,
    frequency: Duration,
    timeout: Duration,
    probes: u64,
}

impl HealthMemo {
    /// Probes at most once per `frequency`, each bounded by `timeout`.
    pub fn new(frequency: Duration, timeout: Duration) -> Self {
        Self {
            last_checked: None,
            healthy: false,
            frequency,
            timeout,
            probes: 0,
        }
    }

    /// Whether a check should run now.
    pub fn is_due(&self, force: bool) -> bool {
        if force {
            return true;
        }
        match self.last_checked {
            None => true,
            Some(at) => at.elapsed() >= self.frequency,
        }
    }

    /// Store an outcome and start a new window.
    pub fn record(&mut self, healthy: bool) {
        self.last_checked = Some(Instant::now());
        self.healthy = healthy;
    }

    /// Store the outcome of a real network probe.
    pub fn record_probe(&mut self, healthy: bool) {
        self.probes = self.probes.saturating_add(1);
        self.record(healthy);
    }

    /// Forget the window so the next check probes.
    pub fn reset(&mut self) {
        self.last_checked = None;
    }

    /// Last recorded outcome.
    pub fn healthy(&self) -> bool {
        self.healthy
    }

    /// Probe connect timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Number of network probes performed so far.
    pub fn probes(&self) -> u64 {
        self.probes
    }
}

/// Try to open a TCP connection to `host:port` within `timeout`.
pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
        Ok(Ok(_))
    )
}
