//! Resilient client for the network-monitor event feed.
//!
//! Connects to a STOMP 1.2 broker over secure WebSocket, keeps
//! subscriptions alive across reconnections, and delivers decoded JSON
//! events to per-destination callbacks in wire order.

pub mod config;
mod dispatcher;
pub mod error;
pub mod monitor;
mod pumps;
pub(crate) mod reconnection;
mod registry;
pub mod session;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use config::MonitorConfig;
pub use error::{
    ConfigError, MonitorError, PayloadDecodeError, SessionError, SubscriptionError,
    TerminalReconnectError, TransportError,
};
pub use monitor::Monitor;
pub use session::{Session, SessionEvent, SessionState};
pub use transport::{ByteSink, ByteStream, Channel, Connector, Endpoint, WsConnector};
pub use types::{
    ConnectionState, Credentials, Event, EventCallback, HeartbeatConfig, MonitorEvent,
    MAX_RECONNECT_DELAY, ReconnectConfig, SubscriptionId,
};
