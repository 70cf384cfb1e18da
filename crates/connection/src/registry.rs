//! Subscription registry.
//!
//! Owns the consumer's subscriptions and, while a session is connected,
//! the handle to that session's writer. The mapping and the writer sit
//! behind one lock so a flush on connect and a concurrent `subscribe`
//! never both send (or both skip) the same SUBSCRIBE.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use network_monitor_protocol::{Command, Frame, header};

use crate::error::SubscriptionError;
use crate::types::{EventCallback, SubscriptionId};

struct Entry {
    id: SubscriptionId,
    destination: String,
    callback: EventCallback,
    /// Per-session id used on the wire; `None` until flushed.
    wire_id: Option<String>,
    confirmed: bool,
}

#[derive(Default)]
struct Inner {
    /// Kept in subscription order so flushes replay in that order.
    entries: Vec<Entry>,
    by_wire: HashMap<String, SubscriptionId>,
    /// Wire ids unsubscribed or rejected during the current session.
    retired: HashSet<String>,
    writer: Option<mpsc::UnboundedSender<Frame>>,
}

impl Inner {
    fn position(&self, id: SubscriptionId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == id)
    }

    fn entry_for_wire(&self, wire_id: &str) -> Option<usize> {
        let id = *self.by_wire.get(wire_id)?;
        self.position(id)
    }

    /// Assigns a fresh wire id and sends SUBSCRIBE. Returns `false` if the
    /// writer is gone.
    fn flush_one(&mut self, index: usize) -> bool {
        let Some(writer) = self.writer.as_ref() else {
            return false;
        };
        let wire_id = uuid::Uuid::new_v4().to_string();
        let entry = &mut self.entries[index];
        let frame = subscribe_frame(&wire_id, &entry.destination);
        if writer.send(frame).is_err() {
            return false;
        }
        trace!(id = %entry.id, wire_id = %wire_id, destination = %entry.destination, "SUBSCRIBE sent");
        entry.wire_id = Some(wire_id.clone());
        entry.confirmed = false;
        self.by_wire.insert(wire_id, entry.id);
        true
    }
}

/// Subscriptions keyed by their stable local id.
#[derive(Default)]
pub(crate) struct Registry {
    inner: Mutex<Inner>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a subscription. Sent immediately if a session is attached,
    /// otherwise queued until the next [`attach`](Self::attach).
    pub(crate) fn subscribe(
        &self,
        destination: String,
        callback: EventCallback,
    ) -> Result<SubscriptionId, SubscriptionError> {
        if destination.trim().is_empty() {
            return Err(SubscriptionError::EmptyDestination);
        }

        let id = SubscriptionId::new();
        let mut inner = self.lock();
        inner.entries.push(Entry {
            id,
            destination,
            callback,
            wire_id: None,
            confirmed: false,
        });
        let index = inner.entries.len() - 1;
        if inner.writer.is_some() && !inner.flush_one(index) {
            debug!(id = %id, "session writer closed, subscription queued");
        }
        Ok(id)
    }

    /// Removes a subscription. Unknown ids are a no-op. Returns whether
    /// anything was removed.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut inner = self.lock();
        let Some(index) = inner.position(id) else {
            return false;
        };
        let entry = inner.entries.remove(index);
        if let Some(wire_id) = entry.wire_id {
            inner.by_wire.remove(&wire_id);
            inner.retired.insert(wire_id.clone());
            if let Some(writer) = inner.writer.as_ref() {
                let frame = Frame::new(Command::Unsubscribe).with_header(header::ID, wire_id);
                let _ = writer.send(frame);
            }
        }
        debug!(id = %id, destination = %entry.destination, "unsubscribed");
        true
    }

    /// Binds a connected session's writer and replays every subscription
    /// under new wire ids. Returns how many SUBSCRIBE frames were sent.
    pub(crate) fn attach(&self, writer: mpsc::UnboundedSender<Frame>) -> usize {
        let mut inner = self.lock();
        inner.by_wire.clear();
        inner.retired.clear();
        inner.writer = Some(writer);
        let mut sent = 0;
        for index in 0..inner.entries.len() {
            if inner.flush_one(index) {
                sent += 1;
            }
        }
        sent
    }

    /// Unbinds the session. Wire ids die with it.
    pub(crate) fn detach(&self) {
        let mut inner = self.lock();
        inner.writer = None;
        inner.by_wire.clear();
        inner.retired.clear();
        for entry in &mut inner.entries {
            entry.wire_id = None;
            entry.confirmed = false;
        }
    }

    #[cfg(test)]
    pub(crate) fn is_attached(&self) -> bool {
        self.lock().writer.is_some()
    }

    /// Queues a frame on the attached session's writer.
    pub(crate) fn send(&self, frame: Frame) -> bool {
        match self.lock().writer.as_ref() {
            Some(writer) => writer.send(frame).is_ok(),
            None => false,
        }
    }

    /// Marks the subscription acknowledged by a RECEIPT.
    pub(crate) fn confirm(&self, receipt_id: &str) -> Option<(SubscriptionId, String)> {
        let mut inner = self.lock();
        let index = inner.entry_for_wire(receipt_id)?;
        let entry = &mut inner.entries[index];
        if entry.confirmed {
            return None;
        }
        entry.confirmed = true;
        Some((entry.id, entry.destination.clone()))
    }

    /// Drops a subscription the server refused. Only unconfirmed
    /// subscriptions can be rejected.
    pub(crate) fn reject(&self, receipt_id: &str) -> Option<(SubscriptionId, String)> {
        let mut inner = self.lock();
        let index = inner.entry_for_wire(receipt_id)?;
        if inner.entries[index].confirmed {
            return None;
        }
        let entry = inner.entries.remove(index);
        inner.by_wire.remove(receipt_id);
        inner.retired.insert(receipt_id.to_string());
        Some((entry.id, entry.destination))
    }

    /// Callbacks a MESSAGE should reach. A live `subscription` header picks
    /// exactly one subscription and a retired one picks none; otherwise
    /// every subscription on the destination matches.
    pub(crate) fn route(
        &self,
        subscription: Option<&str>,
        destination: &str,
    ) -> Vec<(SubscriptionId, EventCallback)> {
        let inner = self.lock();
        if let Some(wire_id) = subscription
            && let Some(index) = inner.entry_for_wire(wire_id)
        {
            let entry = &inner.entries[index];
            return vec![(entry.id, entry.callback.clone())];
        }
        if subscription.is_some_and(|wire_id| inner.retired.contains(wire_id)) {
            return Vec::new();
        }
        inner
            .entries
            .iter()
            .filter(|e| e.destination == destination)
            .map(|e| (e.id, e.callback.clone()))
            .collect()
    }

    /// `(id, destination)` of every subscription, in subscription order.
    pub(crate) fn list(&self) -> Vec<(SubscriptionId, String)> {
        self.lock()
            .entries
            .iter()
            .map(|e| (e.id, e.destination.clone()))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn wire_id(&self, id: SubscriptionId) -> Option<String> {
        let inner = self.lock();
        let index = inner.position(id)?;
        inner.entries[index].wire_id.clone()
    }
}

fn subscribe_frame(wire_id: &str, destination: &str) -> Frame {
    Frame::new(Command::Subscribe)
        .with_header(header::ID, wire_id)
        .with_header(header::DESTINATION, destination)
        .with_header(header::ACK, "auto")
        .with_header(header::RECEIPT, wire_id)
}
