//! Network probe logic.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Reachable,
    Unreachable,
}

#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, address: &str) -> ProbeResult;
}

/// Probes by opening (and immediately dropping) a TCP connection.
#[derive(Debug, Clone)]
pub struct TcpProber {
    default_port: u16,
    timeout: Duration,
}

impl TcpProber {
    pub fn new(default_port: u16, timeout: Duration) -> Self {
        Self {
            default_port,
            timeout,
        }
    }
}

/// `host:port` to dial. Addresses without a port get `default_port`.
fn probe_target(address: &str, default_port: u16) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.parse::<u16>().is_ok() => {
            address.to_string()
        }
        _ if address.contains(':') => format!("[{address}]:{default_port}"),
        _ => format!("{address}:{default_port}"),
    }
}

#[async_trait]
impl Prober for TcpProber {
    async fn probe(&self, address: &str) -> ProbeResult {
        let target = probe_target(address, self.default_port);
        match tokio::time::timeout(self.timeout, TcpStream::connect(target.as_str())).await {
            Ok(Ok(_stream)) => {
                debug!(%target, "probe connected");
                ProbeResult::Reachable
            }
            Ok(Err(e)) => {
                debug!(%target, error = %e, "probe connection failed");
                ProbeResult::Unreachable
            }
            Err(_) => {
                debug!(%target, timeout_ms = self.timeout.as_millis() as u64, "probe timed out");
                ProbeResult::Unreachable
            }
        }
    }
}

/// Probe up to `attempts` times, stopping at the first success.
pub async fn probe_with_retries(prober: &dyn Prober, address: &str, attempts: u32) -> ProbeResult {
    let attempts = attempts.max(1);
    for attempt in 1..=attempts {
        if prober.probe(address).await == ProbeResult::Reachable {
            return ProbeResult::Reachable;
        }
        debug!(%address, attempt, attempts, "probe attempt failed");
    }
    warn!(%address, attempts, "instance unreachable");
    ProbeResult::Unreachable
}

/// In-memory prober with a configurable set of dead addresses (for testing).
#[derive(Debug, Default)]
pub struct StaticProber {
    down: RwLock<HashSet<String>>,
    calls: AtomicUsize,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_down(&self, address: &str) {
        self.down
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.to_string());
    }

    pub fn set_up(&self, address: &str) {
        self.down
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }

    /// Total probes issued so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Prober for StaticProber {
    async fn probe(&self, address: &str) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let down = self
            .down
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(address);
        if down {
            ProbeResult::Unreachable
        } else {
            ProbeResult::Reachable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_target_adds_default_port() {
        assert_eq!(probe_target("10.0.0.1", 25565), "10.0.0.1:25565");
        assert_eq!(probe_target("10.0.0.1:30000", 25565), "10.0.0.1:30000");
        assert_eq!(probe_target("dungeon", 25565), "dungeon:25565");
        assert_eq!(probe_target("dungeon:7", 25565), "dungeon:7");
        assert_eq!(probe_target("::1", 25565), "[::1]:25565");
    }

    #[tokio::test]
    async fn tcp_probe_reaches_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let prober = TcpProber::new(25565, Duration::from_millis(500));
        assert_eq!(prober.probe(&addr.to_string()).await, ProbeResult::Reachable);
    }

    #[tokio::test]
    async fn tcp_probe_to_closed_port_fails() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let prober = TcpProber::new(25565, Duration::from_millis(200));
        assert_eq!(prober.probe(&addr.to_string()).await, ProbeResult::Unreachable);
    }

    #[tokio::test]
    async fn retries_stop_at_bound() {
        let prober = StaticProber::new();
        prober.set_down("10.0.0.1");

        let result = probe_with_retries(&prober, "10.0.0.1", 3).await;
        assert_eq!(result, ProbeResult::Unreachable);
        assert_eq!(prober.calls(), 3);
    }

    #[tokio::test]
    async fn retries_stop_at_first_success() {
        let prober = StaticProber::new();

        let result = probe_with_retries(&prober, "10.0.0.1", 3).await;
        assert_eq!(result, ProbeResult::Reachable);
        assert_eq!(prober.calls(), 1);
    }
}
