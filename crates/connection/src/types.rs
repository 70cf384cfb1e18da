//! Public types for the event feed monitor.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;

use network_monitor_protocol::HeartBeat;

use crate::error::{ConfigError, SubscriptionError};

/// Connection state as seen by the consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Not started, or stopped.
    Disconnected,
    /// Transport and STOMP handshake in progress.
    Connecting,
    /// Handshake complete, subscriptions active.
    Connected,
    /// Connection lost, waiting before the next attempt.
    Reconnecting { attempt: u32 },
    /// Gave up. No further automatic retry.
    Failed { reason: String },
}

/// Locally generated subscription identifier.
///
/// Stable for the lifetime of the subscription, across reconnections.
/// The per-session id sent on the wire is never exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(uuid::Uuid);

impl SubscriptionId {
    pub(crate) fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded event delivered to a subscription callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub destination: String,
    /// Always a JSON object.
    pub payload: serde_json::Value,
    /// Strictly increasing per destination, starting at 1.
    pub received_sequence: u64,
    pub message_id: Option<String>,
}

impl Event {
    /// Deserializes the payload into a destination-specific type.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Consumer callback for decoded events.
pub type EventCallback = Arc<dyn Fn(Event) + Send + Sync>;

/// Events emitted by the monitor.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// A reconnection attempt is scheduled.
    Reconnecting { attempt: u32, next_retry_secs: f64 },
    /// The server acknowledged a SUBSCRIBE.
    SubscriptionConfirmed {
        id: SubscriptionId,
        destination: String,
    },
    /// The server refused a SUBSCRIBE. The subscription has been removed.
    SubscriptionFailed {
        id: SubscriptionId,
        error: SubscriptionError,
    },
    /// The server sent an ERROR frame that ended the session.
    ServerError { message: String },
}

/// Login credentials passed on CONNECT.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub login: String,
    pub passcode: String,
}

impl Credentials {
    pub fn new(login: impl Into<String>, passcode: impl Into<String>) -> Self {
        Self {
            login: login.into(),
            passcode: passcode.into(),
        }
    }

    /// Reads `NETWORK_MONITOR_USERNAME` and `NETWORK_MONITOR_PASSWORD`,
    /// defaulting each to empty.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            login: lookup("NETWORK_MONITOR_USERNAME").unwrap_or_default(),
            passcode: lookup("NETWORK_MONITOR_PASSWORD").unwrap_or_default(),
        }
    }
}

/// Heart-beat intervals offered on CONNECT.
#[derive(Debug, Clone, PartialEq)]
pub struct HeartbeatConfig {
    /// How often the client can send. Zero disables.
    pub outgoing: Duration,
    /// How often the client wants to hear from the server. Zero disables.
    pub incoming: Duration,
    /// Silence longer than `incoming * grace_multiplier` fails the session.
    pub grace_multiplier: f64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            outgoing: Duration::from_millis(5000),
            incoming: Duration::from_millis(5000),
            grace_multiplier: 2.0,
        }
    }
}

impl HeartbeatConfig {
    pub fn offer(&self) -> HeartBeat {
        HeartBeat::new(self.outgoing, self.incoming)
    }

    /// How long the server may stay silent given a negotiated interval.
    pub fn incoming_deadline(&self, negotiated: Duration) -> Option<Duration> {
        if negotiated.is_zero() {
            return None;
        }
        let secs = negotiated.as_secs_f64() * self.grace_multiplier.max(1.0);
        Some(Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !self.grace_multiplier.is_finite() || self.grace_multiplier < 1.0 {
            return Err(ConfigError::Invalid {
                key: "grace_multiplier".into(),
                value: self.grace_multiplier.to_string(),
            });
        }
        Ok(())
    }
}

/// Upper bound accepted for [`ReconnectConfig::max_delay`].
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for automatic reconnection with exponential backoff.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Maximum delay between attempts (backoff cap).
    pub max_delay: Duration,
    /// Multiplier for each subsequent attempt.
    pub backoff_factor: f64,
    /// Fraction of the delay added or removed at random, in `[0, 1)`.
    pub jitter: f64,
    /// Give up after this many consecutive failed attempts.
    pub max_attempts: Option<u32>,
    /// A session connected this long resets the attempt counter.
    pub stability_window: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            jitter: 0.2,
            max_attempts: None,
            stability_window: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Backoff without jitter for a 0-based attempt number:
    /// `min(max_delay, base_delay * backoff_factor^attempt)`.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.min(63) as i32;
        let secs = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        Duration::try_from_secs_f64(capped.max(0.0)).unwrap_or(self.max_delay)
    }

    /// Backoff for a 0-based attempt number with uniform ±`jitter` applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let capped = self.base_delay_for_attempt(attempt).as_secs_f64();
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return Duration::try_from_secs_f64(capped).unwrap_or(self.max_delay);
        }
        let offset: f64 = rand::thread_rng().gen_range(-1.0..=1.0);
        let secs = (capped + capped * jitter * offset).max(0.0);
        Duration::try_from_secs_f64(secs).unwrap_or(MAX_RECONNECT_DELAY)
    }

    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError::Invalid {
                key: "backoff_factor".into(),
                value: self.backoff_factor.to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(ConfigError::Invalid {
                key: "jitter".into(),
                value: self.jitter.to_string(),
            });
        }
        if self.max_delay > MAX_RECONNECT_DELAY {
            return Err(ConfigError::Invalid {
                key: "max_delay".into(),
                value: format!("{:?}", self.max_delay),
            });
        }
        Ok(())
    }
}
