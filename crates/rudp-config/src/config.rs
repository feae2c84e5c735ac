//! Connection and mediator configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Tunables for a single logical connection's reliability engine.
///
/// Mirrors the recognized configuration options a connection accepts:
/// datagram sizing, buffer capacities, the timeout ladder, heartbeat
/// cadence, and the fault-injection knob used by tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Maximum outgoing datagram size, in bytes.
    #[serde(default = "default_mtu")]
    pub mtu: usize,
    /// Sender buffer byte capacity.
    #[serde(default = "default_sender_buffer_size")]
    pub sender_buffer_size: usize,
    /// Receiver buffer byte capacity.
    #[serde(default = "default_receiver_buffer_size")]
    pub receiver_buffer_size: usize,
    /// Steady-state inbound silence timeout, in seconds, before the
    /// connection is force-closed as timed out.
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Inbound silence timeout, in seconds, before the handshake
    /// completes.
    #[serde(default = "default_initial_connection_timeout")]
    pub initial_connection_timeout_secs: u64,
    /// Inbound silence duration, in seconds, that triggers
    /// `connectionLost` without tearing the connection down.
    #[serde(default = "default_connection_warning_timeout")]
    pub connection_warning_timeout_secs: u64,
    /// Heartbeats sent per current RTO interval.
    #[serde(default = "default_heartbeat_frequency")]
    pub heartbeat_frequency: f64,
    /// Fraction in `[0, 1]` of inbound/outbound packets to silently
    /// drop, for fault-injection testing. Zero disables the hook.
    #[serde(default)]
    pub fabricated_packet_drop_rate: f64,
}

fn default_mtu() -> usize {
    1400
}

fn default_sender_buffer_size() -> usize {
    1 << 20
}

fn default_receiver_buffer_size() -> usize {
    1 << 20
}

fn default_connection_timeout() -> u64 {
    10
}

fn default_initial_connection_timeout() -> u64 {
    5
}

fn default_connection_warning_timeout() -> u64 {
    2
}

fn default_heartbeat_frequency() -> f64 {
    2.0
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            sender_buffer_size: default_sender_buffer_size(),
            receiver_buffer_size: default_receiver_buffer_size(),
            connection_timeout_secs: default_connection_timeout(),
            initial_connection_timeout_secs: default_initial_connection_timeout(),
            connection_warning_timeout_secs: default_connection_warning_timeout(),
            heartbeat_frequency: default_heartbeat_frequency(),
            fabricated_packet_drop_rate: 0.0,
        }
    }
}

impl ConnectionConfig {
    /// Steady-state inbound silence timeout.
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }

    /// Inbound silence timeout before the handshake completes.
    pub fn initial_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.initial_connection_timeout_secs)
    }

    /// Inbound silence duration that triggers `connectionLost`.
    pub fn connection_warning_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_warning_timeout_secs)
    }

    /// Heartbeat cadence given the current RTO: `rto / heartbeatFrequency`.
    pub fn heartbeat_interval(&self, rto: Duration) -> Duration {
        rto.div_f64(self.heartbeat_frequency.max(f64::MIN_POSITIVE))
    }

    fn validate(&self) -> Result<()> {
        if self.mtu == 0 {
            return Err(ConfigError::ValidationError("mtu must be non-zero".into()));
        }
        if self.heartbeat_frequency <= 0.0 {
            return Err(ConfigError::ValidationError(
                "heartbeat_frequency must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fabricated_packet_drop_rate) {
            return Err(ConfigError::ValidationError(
                "fabricated_packet_drop_rate must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Bind address and rate limit for the NAT punch-through mediator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediatorConfig {
    /// Bind address.
    #[serde(default = "default_address")]
    pub address: IpAddr,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Inbound packets/sec cap, per remote address. Zero disables the
    /// limit.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,
}

fn default_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    7777
}

fn default_rate_limit() -> u32 {
    1000
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            rate_limit: default_rate_limit(),
        }
    }
}

impl MediatorConfig {
    /// The socket address to bind.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Log output settings, independent of the connection/mediator domain
/// logic they sit alongside.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json or pretty).
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Top-level configuration file shape shared by connection endpoints
/// and the mediator binary; either reads just the section it cares
/// about.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection reliability-engine tunables.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Mediator bind address and rate limit.
    #[serde(default)]
    pub mediator: MediatorConfig,
    /// Log output settings.
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Config {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.connection.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mediator.port, 7777);
        assert_eq!(config.connection.mtu, 1400);
    }

    #[test]
    fn rejects_zero_mtu() {
        let mut config = Config::default();
        config.connection.mtu = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_drop_rate() {
        let mut config = Config::default();
        config.connection.fabricated_packet_drop_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn heartbeat_interval_scales_with_rto() {
        let config = ConnectionConfig { heartbeat_frequency: 2.0, ..Default::default() };
        assert_eq!(config.heartbeat_interval(Duration::from_millis(500)), Duration::from_millis(250));
    }

    #[test]
    fn round_trips_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rudp.toml");
        let config = Config::default();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.connection.mtu, config.connection.mtu);
        assert_eq!(loaded.mediator.port, config.mediator.port);
    }
}
