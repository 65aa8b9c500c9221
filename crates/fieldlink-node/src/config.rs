//! Configuration types for fieldlink-node.
//! Parsed from fieldlink.toml; every key has a fixed default.

use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::poller::PollerSettings;
use crate::relay::RelaySettings;
use crate::server::ServerSettings;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub launch: LaunchSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Seconds of silence before the liveness watchdog logs.
    #[serde(default = "default_30")]
    pub timeout: u64,
    #[serde(default = "default_true")]
    pub respond: bool,
    #[serde(default = "default_5")]
    pub reconnect_interval: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            timeout: 30,
            respond: true,
            reconnect_interval: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_ip")]
    pub ip: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_5")]
    pub reconnect_interval: u64,
    #[serde(default = "default_5")]
    pub connect_timeout: u64,
    /// Carried for deployed configs; the relay does not act on it.
    #[serde(default = "default_10")]
    pub response_timeout: u64,
    /// Carried for deployed configs; the relay does not act on it.
    #[serde(default = "default_15")]
    pub exchange_timeout: u64,
    #[serde(default = "default_3")]
    pub heartbeat_threshold: u64,
    #[serde(default = "default_1")]
    pub heartbeat_interval: u64,
    #[serde(default)]
    pub exchange: bool,
    #[serde(default = "default_relay_serial", deserialize_with = "relay_serial")]
    pub serial: SerialSection,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            port: default_port(),
            reconnect_interval: 5,
            connect_timeout: 5,
            response_timeout: 10,
            exchange_timeout: 15,
            heartbeat_threshold: 3,
            heartbeat_interval: 1,
            exchange: false,
            serial: default_relay_serial(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSection {
    #[serde(default = "default_10")]
    pub message_timeout: u64,
    #[serde(default = "default_5")]
    pub response_timeout: u64,
    #[serde(default = "default_5")]
    pub reopen_interval: u64,
    #[serde(default = "default_poller_serial", deserialize_with = "poller_serial")]
    pub serial: SerialSection,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            message_timeout: 10,
            response_timeout: 5,
            reopen_interval: 5,
            serial: default_poller_serial(),
        }
    }
}

/// A serial port. The device name defaults per section (relay or poller).
#[derive(Debug, Clone, Serialize)]
pub struct SerialSection {
    pub device: String,
    pub baud_rate: u32,
}

/// `[*.serial]` as written, before the section's default device is applied.
#[derive(Deserialize)]
struct SerialTable {
    device: Option<String>,
    #[serde(default = "default_baud_rate")]
    baud_rate: u32,
}

impl SerialTable {
    fn or_device(self, device: &str) -> SerialSection {
        SerialSection {
            device: self.device.unwrap_or_else(|| device.to_string()),
            baud_rate: self.baud_rate,
        }
    }
}

fn relay_serial<'de, D: Deserializer<'de>>(d: D) -> Result<SerialSection, D::Error> {
    Ok(SerialTable::deserialize(d)?.or_device(DEFAULT_RELAY_DEVICE))
}

fn poller_serial<'de, D: Deserializer<'de>>(d: D) -> Result<SerialSection, D::Error> {
    Ok(SerialTable::deserialize(d)?.or_device(DEFAULT_POLLER_DEVICE))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSection {
    /// Seconds between starting consecutive nodes.
    #[serde(default = "default_2")]
    pub delay: u64,
}

impl Default for LaunchSection {
    fn default() -> Self {
        Self { delay: 2 }
    }
}

const DEFAULT_RELAY_DEVICE: &str = "COM25";
const DEFAULT_POLLER_DEVICE: &str = "COM52";

// Default value functions
fn default_ip() -> String {
    "localhost".into()
}
fn default_port() -> u16 {
    12345
}
fn default_true() -> bool {
    true
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_relay_serial() -> SerialSection {
    SerialSection {
        device: DEFAULT_RELAY_DEVICE.into(),
        baud_rate: default_baud_rate(),
    }
}
fn default_poller_serial() -> SerialSection {
    SerialSection {
        device: DEFAULT_POLLER_DEVICE.into(),
        baud_rate: default_baud_rate(),
    }
}
fn default_1() -> u64 {
    1
}
fn default_2() -> u64 {
    2
}
fn default_3() -> u64 {
    3
}
fn default_5() -> u64 {
    5
}
fn default_10() -> u64 {
    10
}
fn default_15() -> u64 {
    15
}
fn default_30() -> u64 {
    30
}

impl LinkConfig {
    /// Load config from file, or use defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: LinkConfig = toml::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Reject values the nodes cannot run with. `launch.delay` may be zero.
    pub fn validate(&self) -> anyhow::Result<()> {
        let periods = [
            ("server.timeout", self.server.timeout),
            ("server.reconnect_interval", self.server.reconnect_interval),
            ("relay.reconnect_interval", self.relay.reconnect_interval),
            ("relay.connect_timeout", self.relay.connect_timeout),
            ("relay.heartbeat_threshold", self.relay.heartbeat_threshold),
            ("relay.heartbeat_interval", self.relay.heartbeat_interval),
            ("poller.message_timeout", self.poller.message_timeout),
            ("poller.response_timeout", self.poller.response_timeout),
            ("poller.reopen_interval", self.poller.reopen_interval),
        ];
        for (key, secs) in periods {
            anyhow::ensure!(secs > 0, "{key} must be at least 1 second");
        }
        anyhow::ensure!(
            !self.relay.serial.device.is_empty() && !self.poller.serial.device.is_empty(),
            "serial device names must not be empty"
        );
        Ok(())
    }

    pub fn server_settings(&self) -> ServerSettings {
        ServerSettings {
            listen_addr: format!("{}:{}", self.server.ip, self.server.port),
            liveness_timeout: Duration::from_secs(self.server.timeout),
            rebind_interval: Duration::from_secs(self.server.reconnect_interval),
            ..ServerSettings::default()
        }
    }

    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            server_addr: format!("{}:{}", self.relay.ip, self.relay.port),
            connect_timeout: Duration::from_secs(self.relay.connect_timeout),
            reconnect_interval: Duration::from_secs(self.relay.reconnect_interval),
            heartbeat_threshold: Duration::from_secs(self.relay.heartbeat_threshold),
            heartbeat_interval: Duration::from_secs(self.relay.heartbeat_interval),
        }
    }

    pub fn poller_settings(&self) -> PollerSettings {
        PollerSettings {
            response_timeout: Duration::from_secs(self.poller.response_timeout),
            message_timeout: Duration::from_secs(self.poller.message_timeout),
            reopen_interval: Duration::from_secs(self.poller.reopen_interval),
            ..PollerSettings::default()
        }
    }

    pub fn launch_delay(&self) -> Duration {
        Duration::from_secs(self.launch.delay)
    }
}
