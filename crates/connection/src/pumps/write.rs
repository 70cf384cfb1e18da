//! Write pump: the only writer on a session's channel.

use std::time::Duration;

use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use bytes::Bytes;
use network_monitor_protocol::Frame;

use crate::error::TransportError;

/// Encodes queued frames onto the sink, one at a time, so frames from
/// different callers never interleave on the wire.
pub(crate) async fn write_pump<S>(
    mut write: S,
    mut write_rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    S: Sink<Bytes, Error = TransportError> + Unpin,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            frame = write_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = frame.validate() {
                            error!(command = %frame.command, error = %e, "refusing to send invalid frame");
                            continue;
                        }
                        trace!(command = %frame.command, "sending frame");
                        if let Err(e) = write.send(frame.encode()).await {
                            error!("channel write error: {e}");
                            return Err(e);
                        }
                    }
                    None => break,
                }
            }
        }
    }

    if let Err(e) = write.close().await {
        debug!(error = %e, "channel close failed");
    }
    Ok(())
}

/// A running write pump and the sender that feeds it.
pub(crate) struct Writer {
    tx: mpsc::UnboundedSender<Frame>,
    handle: JoinHandle<Result<(), TransportError>>,
    cancel: CancellationToken,
}

impl Writer {
    pub(crate) fn spawn<S>(sink: S) -> Self
    where
        S: Sink<Bytes, Error = TransportError> + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(write_pump(sink, rx, cancel.clone()));
        Self { tx, handle, cancel }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<Frame> {
        self.tx.clone()
    }

    pub(crate) fn send(&self, frame: Frame) -> bool {
        self.tx.send(frame).is_ok()
    }

    /// Resolves when the pump stops. Only poll until it first resolves.
    pub(crate) async fn finished(&mut self) -> Result<(), TransportError> {
        match (&mut self.handle).await {
            Ok(result) => result,
            Err(e) => {
                error!("write pump panicked: {e}");
                Err(TransportError::Closed)
            }
        }
    }

    /// Lets the pump drain and close the sink, up to `limit`. Every other
    /// sender must already be dropped for the drain to finish.
    pub(crate) async fn close(self, limit: Duration) {
        let Self {
            tx,
            mut handle,
            cancel,
        } = self;
        drop(tx);
        if tokio::time::timeout(limit, &mut handle).await.is_err() {
            debug!("write pump did not drain in time");
            cancel.cancel();
            handle.abort();
        }
    }

    /// Stops the pump without draining.
    pub(crate) fn abort(self) {
        self.cancel.cancel();
        self.handle.abort();
    }
}
