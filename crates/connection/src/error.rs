//! Error taxonomy for the event feed client.
//!
//! Session-fatal errors ([`TransportError`], [`ProtocolDecodeError`],
//! handshake and heartbeat timeouts, server ERROR frames) are folded into
//! [`SessionError`] and never reach the consumer directly. The consumer
//! sees [`SubscriptionError`] and [`MonitorError`] from its own calls, and
//! state changes through events.

use std::time::Duration;

use network_monitor_protocol::ProtocolDecodeError;
use tokio_tungstenite::tungstenite;

/// Errors from the secure transport channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid endpoint {url:?}: {reason}")]
    InvalidEndpoint { url: String, reason: String },

    #[error("could not connect: {0}")]
    Connect(String),

    #[error("TLS handshake failed: {0}")]
    Tls(String),

    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("connection timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,
}

/// Why a Session ended in `Failed`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolDecodeError),

    #[error("no CONNECTED frame within {0:?}")]
    HandshakeTimeout(Duration),

    #[error("no data from server within {0:?}")]
    HeartbeatTimeout(Duration),

    #[error("server error: {message}")]
    Server { message: String, body: String },

    #[error("unexpected {0} frame during handshake")]
    UnexpectedFrame(&'static str),
}

/// A single MESSAGE could not be turned into an event. Never fatal.
#[derive(Debug, thiserror::Error)]
pub enum PayloadDecodeError {
    #[error("MESSAGE frame without destination")]
    MissingDestination,

    #[error("unexpected content type {0:?}")]
    UnexpectedContentType(String),

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotADocument,
}

/// Errors reported for subscribe/unsubscribe calls and remote rejections.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SubscriptionError {
    #[error("destination must not be empty")]
    EmptyDestination,

    #[error("server rejected subscription to {destination}: {message}")]
    Rejected {
        destination: String,
        message: String,
    },
}

/// The reconnection attempt budget ran out.
#[derive(Debug, Clone, thiserror::Error)]
#[error("gave up after {attempts} reconnection attempts: {last_error}")]
pub struct TerminalReconnectError {
    pub attempts: u32,
    pub last_error: String,
}

/// Errors from the [`Monitor`](crate::Monitor) facade.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor is already running")]
    AlreadyRunning,

    #[error("monitor task panicked: {0}")]
    Panicked(String),

    #[error("not connected")]
    NotConnected,

    #[error(transparent)]
    Terminal(#[from] TerminalReconnectError),

    #[error(transparent)]
    Subscription(#[from] SubscriptionError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Configuration could not be read.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(String),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: String, value: String },
}
