//! Receive loop: the only reader of a connected session's channel.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use network_monitor_protocol::{Command, Frame, FrameDecoder, HeartBeat, header};

use crate::error::{SessionError, SubscriptionError, TransportError};
use crate::pumps::write::Writer;
use crate::session::{Session, SessionContext, server_error};
use crate::transport::ByteStream;
use crate::types::MonitorEvent;

/// Stand-in period for timers that are switched off.
const IDLE: Duration = Duration::from_secs(24 * 60 * 60);

/// Why the receive loop returned.
#[derive(Debug)]
pub(crate) enum ReadExit {
    /// The stop signal fired. The channel is still open.
    Cancelled,
    Failed(SessionError),
}

/// Reads, decodes and routes frames until the session ends.
///
/// Heart-beats are driven from the same loop: an outgoing tick queues a
/// heartbeat on the writer, and any incoming byte pushes the silence
/// deadline out. Frames already buffered are processed before the next
/// wait, so a heartbeat tick never jumps ahead of a decoded MESSAGE.
pub(crate) async fn read_pump(
    stream: &mut ByteStream,
    decoder: &mut FrameDecoder,
    session: &mut Session,
    ctx: &SessionContext,
    writer: &mut Writer,
    heartbeat: HeartBeat,
    cancel: &CancellationToken,
) -> ReadExit {
    // Longer intervals than IDLE are as good as disabled and would overflow `Instant`.
    let silence_limit = ctx
        .config
        .heartbeat
        .incoming_deadline(heartbeat.incoming)
        .map(|limit| limit.min(IDLE));
    let deadline = tokio::time::sleep(silence_limit.unwrap_or(IDLE));
    tokio::pin!(deadline);

    let send_heartbeats = !heartbeat.outgoing.is_zero();
    let period = if send_heartbeats {
        heartbeat.outgoing.min(IDLE)
    } else {
        IDLE
    };
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) = handle_frame(frame, ctx) {
                        return ReadExit::Failed(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "undecodable data from server");
                    return ReadExit::Failed(e.into());
                }
            }
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => return ReadExit::Cancelled,

            chunk = stream.next() => {
                match chunk {
                    Some(Ok(bytes)) => {
                        let now = Instant::now();
                        session.last_heartbeat_received_at = Some(now);
                        if let Some(limit) = silence_limit {
                            deadline.as_mut().reset(now + limit);
                        }
                        decoder.extend(&bytes);
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "channel read failed");
                        return ReadExit::Failed(e.into());
                    }
                    None => return ReadExit::Failed(TransportError::Closed.into()),
                }
            }

            () = &mut deadline, if silence_limit.is_some() => {
                let limit = silence_limit.unwrap_or_default();
                warn!(limit_ms = limit.as_millis() as u64, "server went silent");
                return ReadExit::Failed(SessionError::HeartbeatTimeout(limit));
            }

            _ = ticker.tick(), if send_heartbeats => {
                if !writer.send(Frame::heartbeat()) {
                    return ReadExit::Failed(TransportError::Closed.into());
                }
                trace!("heartbeat sent");
                session.last_heartbeat_sent_at = Some(Instant::now());
            }

            result = writer.finished() => {
                let error = result.err().unwrap_or(TransportError::Closed);
                return ReadExit::Failed(error.into());
            }
        }
    }
}

/// Handles one decoded frame. Only session-fatal conditions are errors.
pub(crate) fn handle_frame(frame: Frame, ctx: &SessionContext) -> Result<(), SessionError> {
    match frame.command {
        Command::Heartbeat => trace!("heartbeat received"),

        Command::Message => {
            if let Err(e) = ctx.dispatcher.dispatch(&frame) {
                warn!(
                    error = %e,
                    destination = frame.header(header::DESTINATION).unwrap_or_default(),
                    message_id = frame.header(header::MESSAGE_ID).unwrap_or_default(),
                    "dropping MESSAGE"
                );
            }
        }

        Command::Receipt => {
            let receipt = frame.header(header::RECEIPT_ID).unwrap_or_default();
            match ctx.registry.confirm(receipt) {
                Some((id, destination)) => {
                    debug!(id = %id, destination = %destination, "subscription confirmed");
                    ctx.notifier
                        .emit(MonitorEvent::SubscriptionConfirmed { id, destination });
                }
                None => trace!(receipt, "unmatched RECEIPT"),
            }
        }

        Command::Error => {
            if let Some(receipt) = frame.header(header::RECEIPT_ID)
                && let Some((id, destination)) = ctx.registry.reject(receipt)
            {
                let message = frame
                    .header(header::MESSAGE)
                    .unwrap_or("subscription refused")
                    .to_string();
                warn!(id = %id, destination = %destination, message = %message, "subscription rejected");
                ctx.notifier.emit(MonitorEvent::SubscriptionFailed {
                    id,
                    error: SubscriptionError::Rejected {
                        destination,
                        message,
                    },
                });
                return Ok(());
            }
            return Err(server_error(&frame));
        }

        other => debug!(command = %other, "ignoring unexpected frame"),
    }
    Ok(())
}
