//! Reachability probes.
//!
//! The manager pings the WAS host before connecting and on every reconnect
//! cycle. ICMP needs raw-socket privileges on most systems, so a TCP
//! connect probe against the WAS port is available as an alternative.

use std::net::IpAddr;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::net::TcpStream;
use tracing::debug;

/// A reachability check against one fixed target.
pub trait Probe: Send + Sync + 'static {
    /// `true` if the target answered within the probe's timeout.
    fn probe(&self) -> BoxFuture<'_, bool>;
}

/// ICMP echo ("ping").
#[derive(Debug, Clone)]
pub struct IcmpProbe {
    host: String,
    timeout: Duration,
}

impl IcmpProbe {
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }
}

impl Probe for IcmpProbe {
    fn probe(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let Some(ip) = resolve(&self.host).await else {
                debug!(host = %self.host, "Probe target does not resolve");
                return false;
            };
            let payload = [0u8; 32];
            match tokio::time::timeout(self.timeout, surge_ping::ping(ip, &payload)).await {
                Ok(Ok((_, rtt))) => {
                    debug!(host = %self.host, ?rtt, "Ping answered");
                    true
                }
                Ok(Err(e)) => {
                    debug!(host = %self.host, "Ping failed: {e}");
                    false
                }
                Err(_) => false,
            }
        })
    }
}

/// TCP connect to a fixed port.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    host: String,
    port: u16,
    timeout: Duration,
}

impl TcpProbe {
    pub fn new(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            timeout,
        }
    }
}

impl Probe for TcpProbe {
    fn probe(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let connect = TcpStream::connect((self.host.as_str(), self.port));
            match tokio::time::timeout(self.timeout, connect).await {
                Ok(Ok(_)) => true,
                Ok(Err(e)) => {
                    debug!(host = %self.host, port = self.port, "TCP probe failed: {e}");
                    false
                }
                Err(_) => false,
            }
        })
    }
}

async fn resolve(host: &str) -> Option<IpAddr> {
    if let Ok(ip) = host.parse() {
        return Some(ip);
    }
    tokio::net::lookup_host((host, 0))
        .await
        .ok()?
        .next()
        .map(|addr| addr.ip())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_probe_sees_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new("127.0.0.1", port, Duration::from_secs(1));
        assert!(probe.probe().await);

        drop(listener);
        assert!(!probe.probe().await);
    }

    #[tokio::test]
    async fn resolve_accepts_literal_address() {
        assert_eq!(resolve("127.0.0.1").await, Some(IpAddr::from([127, 0, 0, 1])));
    }
}
