//! Event dispatcher: MESSAGE frame to consumer callbacks.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace, warn};

use network_monitor_protocol::{Frame, header};

use crate::error::PayloadDecodeError;
use crate::registry::Registry;
use crate::types::Event;

/// Validates MESSAGE envelopes and fans them out to subscriptions.
///
/// Runs on the receive loop only, so callbacks for one destination never
/// overlap and fire in wire order.
pub(crate) struct Dispatcher {
    registry: Arc<Registry>,
    /// Last sequence number per destination. Survives reconnects.
    sequences: Mutex<HashMap<String, u64>>,
}

impl Dispatcher {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        Self {
            registry,
            sequences: Mutex::new(HashMap::new()),
        }
    }

    /// Delivers one MESSAGE. Returns how many callbacks ran.
    ///
    /// A frame nobody subscribes to is dropped with `Ok(0)`. Envelope or
    /// payload problems are returned as errors; the caller logs them and
    /// carries on.
    pub(crate) fn dispatch(&self, frame: &Frame) -> Result<usize, PayloadDecodeError> {
        let destination = frame
            .header(header::DESTINATION)
            .filter(|d| !d.is_empty())
            .ok_or(PayloadDecodeError::MissingDestination)?;

        let targets = self
            .registry
            .route(frame.header(header::SUBSCRIPTION), destination);
        if targets.is_empty() {
            debug!(destination, "no subscription for MESSAGE, dropping");
            return Ok(0);
        }

        if !frame.is_json() {
            let content_type = frame.header(header::CONTENT_TYPE).unwrap_or_default();
            return Err(PayloadDecodeError::UnexpectedContentType(
                content_type.to_string(),
            ));
        }
        let payload: serde_json::Value = frame.parse_json()?;
        if !payload.is_object() {
            return Err(PayloadDecodeError::NotADocument);
        }

        let event = Event {
            destination: destination.to_string(),
            payload,
            received_sequence: self.next_sequence(destination),
            message_id: frame.header(header::MESSAGE_ID).map(str::to_string),
        };
        trace!(
            destination,
            sequence = event.received_sequence,
            subscribers = targets.len(),
            "dispatching event"
        );

        for (id, callback) in &targets {
            let delivered = catch_unwind(AssertUnwindSafe(|| callback(event.clone())));
            if delivered.is_err() {
                warn!(
                    subscription = %id,
                    destination,
                    sequence = event.received_sequence,
                    "callback panicked, event dropped"
                );
            }
        }
        Ok(targets.len())
    }

    fn next_sequence(&self, destination: &str) -> u64 {
        let mut sequences = self
            .sequences
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let seq = sequences.entry(destination.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }
}
