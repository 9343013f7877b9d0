//! Relay configuration.
//!
//! Every component receives the section it needs at construction time.
//! Defaults match the wire constants; a JSON file may override any subset
//! of them, with durations given in milliseconds (`*_ms` keys).

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use relay_protocol::wire::Wire;
use relay_transport::{IcmpProbe, Probe, TcpProbe};
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub was: WasConfig,
    pub clients: ClientConfig,
    pub upload: UploadConfig,
}

impl RelayConfig {
    /// Load a JSON config file on top of the defaults.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ServerError> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| ServerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.was.host.trim().is_empty() {
            return Err(ServerError::Config("was.host must not be empty".into()));
        }
        if self.clients.max_push_retries == 0 {
            return Err(ServerError::Config("clients.max_push_retries must be at least 1".into()));
        }
        for (name, value) in [
            ("was.poll_interval_ms", self.was.poll_interval),
            ("was.keep_alive_interval_ms", self.was.keep_alive_interval),
            ("was.reconnect_interval_ms", self.was.reconnect_interval),
            ("clients.cycle_interval_ms", self.clients.cycle_interval),
            ("clients.network_timeout_ms", self.clients.network_timeout),
            ("clients.keep_alive_interval_ms", self.clients.keep_alive_interval),
        ] {
            if value.is_zero() {
                return Err(ServerError::Config(format!("{name} must be positive")));
            }
        }
        if self.upload.enabled && self.upload.url.trim().is_empty() {
            return Err(ServerError::Config("upload.url is required when upload is enabled".into()));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// WAS side
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    #[default]
    Icmp,
    Tcp,
}

impl std::str::FromStr for ProbeKind {
    type Err = ServerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "icmp" => Ok(Self::Icmp),
            "tcp" => Ok(Self::Tcp),
            other => Err(ServerError::Config(format!("unknown probe kind '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WasConfig {
    pub host: String,
    pub port: u16,
    #[serde(rename = "keep_alive_interval_ms", with = "millis")]
    pub keep_alive_interval: Duration,
    #[serde(rename = "poll_interval_ms", with = "millis")]
    pub poll_interval: Duration,
    #[serde(rename = "reconnect_interval_ms", with = "millis")]
    pub reconnect_interval: Duration,
    #[serde(rename = "connect_timeout_ms", with = "millis")]
    pub connect_timeout: Duration,
    pub probe: ProbeKind,
    #[serde(rename = "probe_timeout_ms", with = "millis")]
    pub probe_timeout: Duration,
}

impl Default for WasConfig {
    fn default() -> Self {
        Self {
            host: "192.168.130.100".into(),
            port: Wire::WAS_DEFAULT_PORT,
            keep_alive_interval: Wire::WAS_KEEP_ALIVE_INTERVAL,
            poll_interval: Wire::WAS_POLL_INTERVAL,
            reconnect_interval: Wire::WAS_RECONNECT_INTERVAL,
            connect_timeout: Duration::from_secs(10),
            probe: ProbeKind::Icmp,
            probe_timeout: Duration::from_secs(2),
        }
    }
}

impl WasConfig {
    /// The reachability probe this configuration asks for.
    pub fn build_probe(&self) -> Arc<dyn Probe> {
        match self.probe {
            ProbeKind::Icmp => Arc::new(IcmpProbe::new(self.host.clone(), self.probe_timeout)),
            ProbeKind::Tcp => Arc::new(TcpProbe::new(self.host.clone(), self.port, self.probe_timeout)),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client side
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub bind: String,
    pub port: u16,
    #[serde(rename = "cycle_interval_ms", with = "millis")]
    pub cycle_interval: Duration,
    /// Time without an acknowledgement before a push is repeated.
    #[serde(rename = "network_timeout_ms", with = "millis")]
    pub network_timeout: Duration,
    pub max_push_retries: u32,
    #[serde(rename = "keep_alive_interval_ms", with = "millis")]
    pub keep_alive_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: Wire::CLIENT_DEFAULT_PORT,
            cycle_interval: Wire::CLIENT_CYCLE_INTERVAL,
            network_timeout: Wire::NETWORK_TIMEOUT,
            max_push_retries: Wire::MAX_PUSH_RETRIES,
            keep_alive_interval: Wire::CLIENT_KEEP_ALIVE_INTERVAL,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Upload
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    pub enabled: bool,
    pub url: String,
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
