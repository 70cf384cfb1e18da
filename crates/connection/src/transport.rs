//! Secure transport channel.
//!
//! A [`Channel`] is a full-duplex byte pipe. Each `receive` may yield any
//! slice of the STOMP stream, so callers accumulate into a decoder.
//! [`WsConnector`] opens channels over WebSocket with rustls; tests swap in
//! their own [`Connector`].

use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tracing::{debug, trace};

use network_monitor_protocol::constants::MAX_FRAME_SIZE;

use crate::error::{ConfigError, TransportError};

/// Write half of a [`Channel`].
pub type ByteSink = Pin<Box<dyn Sink<Bytes, Error = TransportError> + Send>>;

/// Read half of a [`Channel`].
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// A `ws://` or `wss://` feed address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    url: String,
    host: String,
    secure: bool,
}

impl Endpoint {
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = url.parse().map_err(|_| invalid("malformed URL"))?;
        let secure = match uri.scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            Some(_) => return Err(invalid("scheme must be ws or wss")),
            None => return Err(invalid("missing scheme")),
        };
        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| invalid("missing host"))?;

        Ok(Self {
            url: url.to_string(),
            host: host.to_string(),
            secure,
        })
    }

    /// Reads `NETWORK_MONITOR_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        const KEY: &str = "NETWORK_MONITOR_URL";
        let url = lookup(KEY).ok_or_else(|| ConfigError::Missing(KEY.into()))?;
        Self::parse(&url).map_err(|_| ConfigError::Invalid {
            key: KEY.into(),
            value: url,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Host name sent in the CONNECT `host` header.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// An open, full-duplex byte channel.
pub struct Channel {
    sink: ByteSink,
    stream: ByteStream,
}

impl Channel {
    pub fn new<W, R>(sink: W, stream: R) -> Self
    where
        W: Sink<Bytes, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    pub async fn send(&mut self, bytes: Bytes) -> Result<(), TransportError> {
        self.sink.send(bytes).await
    }

    /// Returns the next chunk. A finished stream is [`TransportError::Closed`].
    pub async fn receive(&mut self) -> Result<Bytes, TransportError> {
        self.stream.next().await.unwrap_or(Err(TransportError::Closed))
    }

    /// Best-effort graceful shutdown. The channel is released either way.
    pub async fn close(mut self) {
        if let Err(e) = self.sink.close().await {
            debug!(error = %e, "channel close failed");
        }
    }

    pub fn split(self) -> (ByteSink, ByteStream) {
        (self.sink, self.stream)
    }
}

/// Factory for channels: resolve, connect, secure, upgrade.
///
/// The returned future must be cancel-safe to drop.
pub trait Connector: Send + Sync {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint)
    -> BoxFuture<'a, Result<Channel, TransportError>>;
}

/// WebSocket connector. `wss://` endpoints use rustls with either the
/// bundled webpki roots or a caller-supplied client config.
#[derive(Clone)]
pub struct WsConnector {
    tls: Option<Arc<rustls::ClientConfig>>,
    max_message_size: usize,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl WsConnector {
    pub fn new() -> Self {
        // Err just means a provider is already installed.
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            tls: None,
            max_message_size: MAX_FRAME_SIZE,
        }
    }

    /// Uses a pre-configured trust context instead of the bundled roots.
    pub fn with_tls_config(config: Arc<rustls::ClientConfig>) -> Self {
        Self {
            tls: Some(config),
            ..Self::new()
        }
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    async fn open(&self, endpoint: &Endpoint) -> Result<Channel, TransportError> {
        let mut ws_config = WebSocketConfig::default();
        ws_config.max_message_size = Some(self.max_message_size);
        ws_config.max_frame_size = Some(self.max_message_size);
        let connector = self
            .tls
            .clone()
            .map(tokio_tungstenite::Connector::Rustls);

        let (ws_stream, _) = tokio_tungstenite::connect_async_tls_with_config(
            endpoint.url(),
            Some(ws_config),
            false,
            connector,
        )
        .await
        .map_err(classify)?;
        debug!(url = %endpoint.url(), "websocket open");

        let (write, read) = ws_stream.split();
        let sink = write
            .sink_map_err(TransportError::from)
            .with(|bytes: Bytes| future::ready(Ok::<_, TransportError>(to_message(bytes))));
        let stream = read.filter_map(|msg| future::ready(from_message(msg)));
        Ok(Channel::new(sink, stream))
    }
}

impl Connector for WsConnector {
    fn connect<'a>(
        &'a self,
        endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<Channel, TransportError>> {
        Box::pin(self.open(endpoint))
    }
}

/// Maps handshake failures onto the transport taxonomy.
fn classify(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Io(e) => TransportError::Connect(e.to_string()),
        tungstenite::Error::Tls(e) => TransportError::Tls(e.to_string()),
        tungstenite::Error::Url(e) => TransportError::Connect(e.to_string()),
        other => TransportError::Ws(other),
    }
}

fn to_message(bytes: Bytes) -> tungstenite::Message {
    match String::from_utf8(bytes.to_vec()) {
        Ok(text) => tungstenite::Message::Text(text.into()),
        Err(e) => tungstenite::Message::Binary(e.into_bytes().into()),
    }
}

fn from_message(
    msg: Result<tungstenite::Message, tungstenite::Error>,
) -> Option<Result<Bytes, TransportError>> {
    match msg {
        Ok(tungstenite::Message::Text(text)) => {
            Some(Ok(Bytes::copy_from_slice(text.as_bytes())))
        }
        Ok(tungstenite::Message::Binary(data)) => Some(Ok(data)),
        Ok(tungstenite::Message::Close(frame)) => {
            debug!(?frame, "received close frame");
            Some(Err(TransportError::Closed))
        }
        Ok(_) => {
            trace!("ignoring websocket control message");
            None
        }
        Err(e) => Some(Err(TransportError::from(e))),
    }
}
