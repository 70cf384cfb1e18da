//! Session engine: one connection lifecycle from connect to close.
//!
//! ```text
//! Idle -> TransportConnecting -> ProtocolHandshaking -> Connected
//!      -> Disconnecting -> Closed
//! ```
//!
//! Any fault before `Closed` lands in `Failed`. The engine never returns a
//! session-fatal error as `Err`; it reports a [`SessionOutcome`] that the
//! reconnection controller acts on.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use network_monitor_protocol::constants::STOMP_VERSION;
use network_monitor_protocol::{Command, Frame, FrameDecoder, HeartBeat, header};

use crate::config::MonitorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{SessionError, TransportError};
use crate::monitor::Notifier;
use crate::pumps::read::{ReadExit, read_pump};
use crate::pumps::write::Writer;
use crate::registry::Registry;
use crate::transport::{ByteSink, ByteStream, Connector, Endpoint};
use crate::types::{ConnectionState, Credentials, MonitorEvent};

/// Lifecycle state of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    TransportConnecting,
    ProtocolHandshaking,
    Connected,
    Disconnecting,
    Closed,
    Failed,
}

/// Inputs to the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Start,
    ChannelReady,
    HandshakeAcknowledged,
    TeardownRequested,
    CloseComplete,
    /// Transport error, decode error, timeout or server ERROR.
    Fault,
}

impl SessionState {
    /// Returns the next state, or `None` if `event` is not valid here.
    pub fn transition(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        match (self, event) {
            (S::Idle, E::Start) => Some(S::TransportConnecting),
            (S::TransportConnecting, E::ChannelReady) => Some(S::ProtocolHandshaking),
            (S::ProtocolHandshaking, E::HandshakeAcknowledged) => Some(S::Connected),
            (S::Connected, E::TeardownRequested) => Some(S::Disconnecting),
            (S::Disconnecting, E::CloseComplete) => Some(S::Closed),
            // Nothing to tear down gracefully before the handshake completes.
            (S::Idle | S::TransportConnecting | S::ProtocolHandshaking, E::TeardownRequested) => {
                Some(S::Closed)
            }
            (s, E::Fault) if !s.is_terminal() => Some(S::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

/// Mutable state of the live session. Owned by the engine.
#[derive(Debug, Clone)]
pub struct Session {
    pub state: SessionState,
    /// Assigned by the server in CONNECTED.
    pub session_id: Option<String>,
    pub last_heartbeat_sent_at: Option<Instant>,
    pub last_heartbeat_received_at: Option<Instant>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            session_id: None,
            last_heartbeat_sent_at: None,
            last_heartbeat_received_at: None,
        }
    }

    /// Applies `event`. Invalid events leave the state unchanged.
    pub fn advance(&mut self, event: SessionEvent) -> SessionState {
        match self.state.transition(event) {
            Some(next) => {
                trace!(from = ?self.state, to = ?next, ?event, "session transition");
                self.state = next;
            }
            None => debug!(state = ?self.state, ?event, "ignoring invalid session event"),
        }
        self.state
    }
}

/// How a session ended.
#[derive(Debug)]
pub(crate) enum SessionOutcome {
    /// The stop signal fired.
    Stopped,
    Failed {
        error: SessionError,
        /// How long the session stayed connected, if it got that far.
        connected_for: Option<Duration>,
    },
}

/// Everything a session needs, shared across reconnections.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) endpoint: Endpoint,
    pub(crate) credentials: Credentials,
    pub(crate) config: Arc<MonitorConfig>,
    pub(crate) registry: Arc<Registry>,
    pub(crate) dispatcher: Arc<Dispatcher>,
    pub(crate) notifier: Arc<Notifier>,
}

/// A channel that has completed the STOMP handshake.
struct Handshake {
    sink: ByteSink,
    stream: ByteStream,
    /// May already hold frames that arrived behind CONNECTED.
    decoder: FrameDecoder,
    heartbeat: HeartBeat,
}

/// Runs one session to completion.
pub(crate) async fn run_session(ctx: &SessionContext, cancel: &CancellationToken) -> SessionOutcome {
    let mut session = Session::new();
    session.advance(SessionEvent::Start);
    ctx.notifier.set_state(ConnectionState::Connecting);

    let handshake = match establish(ctx, &mut session, cancel).await {
        Ok(Some(handshake)) => handshake,
        Ok(None) => {
            session.advance(SessionEvent::TeardownRequested);
            debug!("stopped before the session was established");
            return SessionOutcome::Stopped;
        }
        Err(error) => return fail(ctx, &mut session, error, None),
    };
    let Handshake {
        sink,
        mut stream,
        mut decoder,
        heartbeat,
    } = handshake;

    let connected_at = Instant::now();
    info!(
        url = %ctx.endpoint.url(),
        session = session.session_id.as_deref().unwrap_or_default(),
        heartbeat_out_ms = heartbeat.outgoing.as_millis() as u64,
        heartbeat_in_ms = heartbeat.incoming.as_millis() as u64,
        "session established"
    );

    let mut writer = Writer::spawn(sink);
    let flushed = ctx.registry.attach(writer.sender());
    debug!(subscriptions = flushed, "subscriptions flushed");
    ctx.notifier.set_state(ConnectionState::Connected);

    let exit = read_pump(
        &mut stream,
        &mut decoder,
        &mut session,
        ctx,
        &mut writer,
        heartbeat,
        cancel,
    )
    .await;
    ctx.registry.detach();

    match exit {
        ReadExit::Cancelled => {
            disconnect(ctx, &mut session, &mut stream, &mut decoder, writer).await;
            SessionOutcome::Stopped
        }
        ReadExit::Failed(error) => {
            writer.abort();
            fail(ctx, &mut session, error, Some(connected_at.elapsed()))
        }
    }
}

/// Connects the transport and performs the CONNECT/CONNECTED exchange.
/// `Ok(None)` means the stop signal fired first.
async fn establish(
    ctx: &SessionContext,
    session: &mut Session,
    cancel: &CancellationToken,
) -> Result<Option<Handshake>, SessionError> {
    debug!(url = %ctx.endpoint.url(), "connecting transport");
    let connect = tokio::time::timeout(
        ctx.config.connect_timeout,
        ctx.connector.connect(&ctx.endpoint),
    );
    let channel = tokio::select! {
        _ = cancel.cancelled() => return Ok(None),
        result = connect => result.map_err(|_| TransportError::Timeout)??,
    };
    session.advance(SessionEvent::ChannelReady);

    let (mut sink, mut stream) = channel.split();
    let offer = ctx.config.heartbeat.offer();
    let frame = connect_frame(&ctx.endpoint, &ctx.credentials, offer);
    sink.send(frame.encode()).await?;
    trace!(host = %ctx.endpoint.host(), "CONNECT sent");

    let mut decoder = FrameDecoder::new(ctx.config.max_frame_size);
    let limit = ctx.config.handshake_timeout;
    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = sink.close().await;
            return Ok(None);
        }
        result = tokio::time::timeout(limit, await_connected(&mut stream, &mut decoder)) => {
            result.map_err(|_| SessionError::HandshakeTimeout(limit))??
        }
    };

    session.session_id = connected.header(header::SESSION).map(str::to_string);
    let server = connected
        .header(header::HEART_BEAT)
        .and_then(HeartBeat::parse)
        .unwrap_or_default();
    let heartbeat = HeartBeat::negotiate(offer, server);
    session.advance(SessionEvent::HandshakeAcknowledged);

    Ok(Some(Handshake {
        sink,
        stream,
        decoder,
        heartbeat,
    }))
}

/// The CONNECT frame. Empty credentials are left out.
pub(crate) fn connect_frame(endpoint: &Endpoint, credentials: &Credentials, offer: HeartBeat) -> Frame {
    let mut frame = Frame::new(Command::Connect)
        .with_header(header::ACCEPT_VERSION, STOMP_VERSION)
        .with_header(header::HOST, endpoint.host());
    if !credentials.login.is_empty() {
        frame = frame.with_header(header::LOGIN, credentials.login.as_str());
    }
    if !credentials.passcode.is_empty() {
        frame = frame.with_header(header::PASSCODE, credentials.passcode.as_str());
    }
    frame.with_header(header::HEART_BEAT, offer.to_header_value())
}

async fn await_connected(
    stream: &mut ByteStream,
    decoder: &mut FrameDecoder,
) -> Result<Frame, SessionError> {
    loop {
        while let Some(frame) = decoder.next_frame()? {
            match frame.command {
                Command::Heartbeat => continue,
                Command::Connected => return Ok(frame),
                Command::Error => return Err(server_error(&frame)),
                other => return Err(SessionError::UnexpectedFrame(other.as_str())),
            }
        }
        let chunk = stream.next().await.unwrap_or(Err(TransportError::Closed))?;
        decoder.extend(&chunk);
    }
}

/// Sends DISCONNECT, waits for its receipt, then closes the channel.
async fn disconnect(
    ctx: &SessionContext,
    session: &mut Session,
    stream: &mut ByteStream,
    decoder: &mut FrameDecoder,
    writer: Writer,
) {
    session.advance(SessionEvent::TeardownRequested);
    let limit = ctx.config.disconnect_timeout;
    let receipt = format!("disconnect-{}", uuid::Uuid::new_v4());
    let frame = Frame::new(Command::Disconnect).with_header(header::RECEIPT, receipt.as_str());

    if writer.send(frame) {
        match tokio::time::timeout(limit, await_receipt(stream, decoder, &receipt)).await {
            Ok(Ok(())) => debug!("DISCONNECT acknowledged"),
            Ok(Err(e)) => debug!(error = %e, "channel failed while disconnecting"),
            Err(_) => debug!(limit_ms = limit.as_millis() as u64, "no DISCONNECT receipt"),
        }
    }
    writer.close(limit).await;
    session.advance(SessionEvent::CloseComplete);
    info!(
        session = session.session_id.as_deref().unwrap_or_default(),
        "session closed"
    );
}

async fn await_receipt(
    stream: &mut ByteStream,
    decoder: &mut FrameDecoder,
    receipt: &str,
) -> Result<(), SessionError> {
    loop {
        while let Some(frame) = decoder.next_frame()? {
            if frame.command == Command::Receipt && frame.header(header::RECEIPT_ID) == Some(receipt)
            {
                return Ok(());
            }
            trace!(command = %frame.command, "discarding frame while disconnecting");
        }
        let chunk = stream.next().await.unwrap_or(Err(TransportError::Closed))?;
        decoder.extend(&chunk);
    }
}

/// Turns an ERROR frame into a session error.
pub(crate) fn server_error(frame: &Frame) -> SessionError {
    SessionError::Server {
        message: frame
            .header(header::MESSAGE)
            .unwrap_or("server error")
            .to_string(),
        body: String::from_utf8_lossy(&frame.body).into_owned(),
    }
}

fn fail(
    ctx: &SessionContext,
    session: &mut Session,
    error: SessionError,
    connected_for: Option<Duration>,
) -> SessionOutcome {
    session.advance(SessionEvent::Fault);
    if let SessionError::Server { message, .. } = &error {
        ctx.notifier.emit(MonitorEvent::ServerError {
            message: message.clone(),
        });
    }
    warn!(
        error = %error,
        session = session.session_id.as_deref().unwrap_or_default(),
        "session failed"
    );
    SessionOutcome::Failed {
        error,
        connected_for,
    }
}
