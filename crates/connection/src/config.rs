//! Monitor configuration.
//!
//! Every knob has a default. [`MonitorConfig::from_env`] overlays
//! `NETWORK_MONITOR_*` variables; durations are given in milliseconds.

use std::str::FromStr;
use std::time::Duration;

use network_monitor_protocol::constants::MAX_FRAME_SIZE;

use crate::error::ConfigError;
use crate::types::{HeartbeatConfig, ReconnectConfig};

/// Policy knobs for one [`Monitor`](crate::Monitor).
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorConfig {
    /// Bound on resolve + TCP + TLS + WebSocket upgrade.
    pub connect_timeout: Duration,
    /// Bound on waiting for CONNECTED after sending CONNECT.
    pub handshake_timeout: Duration,
    /// Bound on waiting for the DISCONNECT receipt.
    pub disconnect_timeout: Duration,
    /// Largest frame the decoder will buffer.
    pub max_frame_size: usize,
    pub heartbeat: HeartbeatConfig,
    pub reconnect: ReconnectConfig,
    /// Capacity of the [`MonitorEvent`](crate::MonitorEvent) channel.
    pub event_buffer: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(5),
            max_frame_size: MAX_FRAME_SIZE,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            event_buffer: 64,
        }
    }
}

impl MonitorConfig {
    /// Defaults overlaid with `NETWORK_MONITOR_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each key.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = millis(&lookup, "NETWORK_MONITOR_CONNECT_TIMEOUT_MS")? {
            config.connect_timeout = v;
        }
        if let Some(v) = millis(&lookup, "NETWORK_MONITOR_HANDSHAKE_TIMEOUT_MS")? {
            config.handshake_timeout = v;
        }
        if let Some(v) = millis(&lookup, "NETWORK_MONITOR_DISCONNECT_TIMEOUT_MS")? {
            config.disconnect_timeout = v;
        }
        if let Some(v) = parsed(&lookup, "NETWORK_MONITOR_MAX_FRAME_SIZE")? {
            config.max_frame_size = v;
        }
        if let Some(v) = parsed(&lookup, "NETWORK_MONITOR_EVENT_BUFFER")? {
            config.event_buffer = v;
        }

        if let Some(v) = millis(&lookup, "NETWORK_MONITOR_HEARTBEAT_OUTGOING_MS")? {
            config.heartbeat.outgoing = v;
        }
        if let Some(v) = millis(&lookup, "NETWORK_MONITOR_HEARTBEAT_INCOMING_MS")? {
            config.heartbeat.incoming = v;
        }
        if let Some(v) = parsed(&lookup, "NETWORK_MONITOR_HEARTBEAT_GRACE")? {
            config.heartbeat.grace_multiplier = v;
        }

        if let Some(v) = millis(&lookup, "NETWORK_MONITOR_RECONNECT_BASE_MS")? {
            config.reconnect.base_delay = v;
        }
        if let Some(v) = millis(&lookup, "NETWORK_MONITOR_RECONNECT_MAX_MS")? {
            config.reconnect.max_delay = v;
        }
        if let Some(v) = parsed(&lookup, "NETWORK_MONITOR_RECONNECT_FACTOR")? {
            config.reconnect.backoff_factor = v;
        }
        if let Some(v) = parsed(&lookup, "NETWORK_MONITOR_RECONNECT_JITTER")? {
            config.reconnect.jitter = v;
        }
        if let Some(v) = parsed(&lookup, "NETWORK_MONITOR_RECONNECT_MAX_ATTEMPTS")? {
            config.reconnect.max_attempts = Some(v);
        }
        if let Some(v) = millis(&lookup, "NETWORK_MONITOR_STABILITY_WINDOW_MS")? {
            config.reconnect.stability_window = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid {
                key: "event_buffer".into(),
                value: "0".into(),
            });
        }
        if self.max_frame_size == 0 {
            return Err(ConfigError::Invalid {
                key: "max_frame_size".into(),
                value: "0".into(),
            });
        }
        self.heartbeat.validate()?;
        self.reconnect.validate()
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value: raw,
            }),
    }
}

fn millis(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    Ok(parsed::<u64>(lookup, key)?.map(Duration::from_millis))
}
