//! In-memory connector for session and monitor tests.
//!
//! Every successful `connect` hands the test a [`ServerSide`] through which
//! it plays the broker: reading the client's frames and writing raw bytes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::{sink, stream};
use tokio::sync::mpsc;

use network_monitor_protocol::{Command, Frame, FrameDecoder, header};

use crate::config::MonitorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::TransportError;
use crate::monitor::Notifier;
use crate::registry::Registry;
use crate::session::SessionContext;
use crate::transport::{Channel, Connector, Endpoint};
use crate::types::{Credentials, HeartbeatConfig, MonitorEvent};

/// The broker end of one in-memory channel.
pub(crate) struct ServerSide {
    to_client: mpsc::UnboundedSender<Result<Bytes, TransportError>>,
    from_client: mpsc::UnboundedReceiver<Bytes>,
    decoder: FrameDecoder,
}

impl ServerSide {
    /// Next non-heartbeat frame from the client, or `None` once it hung up.
    pub(crate) async fn next_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                if frame.is_heartbeat() {
                    continue;
                }
                return Some(frame);
            }
            let chunk = self.from_client.recv().await?;
            self.decoder.extend(&chunk);
        }
    }

    /// Next frame including heartbeats.
    pub(crate) async fn next_any(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return Some(frame);
            }
            let chunk = self.from_client.recv().await?;
            self.decoder.extend(&chunk);
        }
    }

    /// Next frame, asserting its command.
    pub(crate) async fn expect(&mut self, command: Command) -> Frame {
        let frame = self.next_frame().await.expect("client hung up");
        assert_eq!(frame.command, command, "unexpected frame: {frame:?}");
        frame
    }

    pub(crate) fn send_raw(&self, bytes: impl Into<Bytes>) {
        let _ = self.to_client.send(Ok(bytes.into()));
    }

    pub(crate) fn send(&self, frame: &Frame) {
        self.send_raw(frame.encode());
    }

    /// Reads CONNECT and answers CONNECTED with the given heart-beat.
    pub(crate) async fn accept(&mut self, heart_beat: &str) -> Frame {
        let connect = self.expect(Command::Connect).await;
        self.send(
            &Frame::new(Command::Connected)
                .with_header(header::VERSION, "1.2")
                .with_header(header::SESSION, "session-1")
                .with_header(header::HEART_BEAT, heart_beat),
        );
        connect
    }

    /// Simulates a mid-stream reset.
    pub(crate) fn reset(&self) {
        let _ = self
            .to_client
            .send(Err(TransportError::Connect("connection reset by peer".into())));
    }
}

/// Connector backed by unbounded channels.
pub(crate) struct MockConnector {
    accepted: mpsc::UnboundedSender<ServerSide>,
    refuse: AtomicU32,
    pub(crate) attempts: AtomicU32,
}

impl MockConnector {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerSide>) {
        let (accepted, rx) = mpsc::unbounded_channel();
        let connector = Arc::new(Self {
            accepted,
            refuse: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        });
        (connector, rx)
    }

    /// Fails the next `n` connects.
    pub(crate) fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    fn connect<'a>(
        &'a self,
        _endpoint: &'a Endpoint,
    ) -> BoxFuture<'a, Result<Channel, TransportError>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            let refused = self
                .refuse
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(TransportError::Connect("connection refused".into()));
            }

            let (to_client, client_rx) = mpsc::unbounded_channel();
            let (client_tx, from_client) = mpsc::unbounded_channel::<Bytes>();

            let incoming = stream::unfold(client_rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            });
            let outgoing = sink::unfold(client_tx, |tx, bytes: Bytes| async move {
                tx.send(bytes).map_err(|_| TransportError::Closed)?;
                Ok::<_, TransportError>(tx)
            });

            let _ = self.accepted.send(ServerSide {
                to_client,
                from_client,
                decoder: FrameDecoder::default(),
            });
            Ok(Channel::new(outgoing, incoming))
        })
    }
}

pub(crate) fn endpoint() -> Endpoint {
    Endpoint::parse("wss://feed.example.com/network-events").unwrap()
}

/// Config with heart-beats off and a fast, jitter-free backoff.
pub(crate) fn quiet_config() -> MonitorConfig {
    let mut config = MonitorConfig {
        heartbeat: HeartbeatConfig {
            outgoing: std::time::Duration::ZERO,
            incoming: std::time::Duration::ZERO,
            grace_multiplier: 2.0,
        },
        ..MonitorConfig::default()
    };
    config.reconnect.base_delay = std::time::Duration::from_millis(100);
    config.reconnect.jitter = 0.0;
    config
}

/// A MESSAGE frame with a JSON body.
pub(crate) fn message(destination: &str, subscription: &str, body: &str) -> Frame {
    Frame::new(Command::Message)
        .with_header(header::DESTINATION, destination)
        .with_header(header::MESSAGE_ID, uuid::Uuid::new_v4().to_string())
        .with_header(header::SUBSCRIPTION, subscription)
        .with_header(header::CONTENT_TYPE, "application/json")
        .with_body(body.to_string())
}

/// A session context over a fresh [`MockConnector`] and [`quiet_config`].
pub(crate) fn context() -> (SessionContext, mpsc::Receiver<MonitorEvent>) {
    let (connector, _accepted) = MockConnector::new();
    context_with(connector, quiet_config())
}

pub(crate) fn context_with(
    connector: Arc<dyn Connector>,
    config: MonitorConfig,
) -> (SessionContext, mpsc::Receiver<MonitorEvent>) {
    let (notifier, events) = Notifier::new(config.event_buffer);
    let registry = Arc::new(Registry::new());
    let ctx = SessionContext {
        connector,
        endpoint: endpoint(),
        credentials: Credentials::default(),
        config: Arc::new(config),
        dispatcher: Arc::new(Dispatcher::new(registry.clone())),
        registry,
        notifier: Arc::new(notifier),
    };
    (ctx, events)
}
