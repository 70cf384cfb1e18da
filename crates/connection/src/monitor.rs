//! Monitor facade: the consumer-facing entry point.
//!
//! Owns the subscription registry and the background task that runs
//! sessions under the reconnection controller.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use network_monitor_protocol::{Command, Frame, header};

use crate::config::MonitorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, MonitorError, SubscriptionError};
use crate::reconnection;
use crate::registry::Registry;
use crate::session::SessionContext;
use crate::transport::{Connector, Endpoint, WsConnector};
use crate::types::{ConnectionState, Credentials, Event, MonitorEvent, SubscriptionId};

/// Publishes connection state and monitor events.
pub(crate) struct Notifier {
    state_tx: watch::Sender<ConnectionState>,
    events_tx: mpsc::Sender<MonitorEvent>,
}

impl Notifier {
    pub(crate) fn new(buffer: usize) -> (Self, mpsc::Receiver<MonitorEvent>) {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (events_tx, events_rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                state_tx,
                events_tx,
            },
            events_rx,
        )
    }

    /// Updates the state and emits `StateChanged` if it actually changed.
    pub(crate) fn set_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        if changed {
            debug!(state = ?state, "connection state changed");
            self.emit(MonitorEvent::StateChanged(state));
        }
    }

    /// Queues an event without waiting. Dropped if the consumer lags.
    pub(crate) fn emit(&self, event: MonitorEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => warn!(?event, "event channel full, dropping event"),
            Err(TrySendError::Closed(_)) => trace!("event receiver dropped"),
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state_tx.borrow().clone()
    }

    pub(crate) fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }
}

/// The background controller task.
struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<Result<(), MonitorError>>,
}

/// Runs the reconnection controller. A panic is published as `Failed`
/// instead of leaving the last state in place.
async fn supervise(ctx: SessionContext, cancel: CancellationToken) -> Result<(), MonitorError> {
    let notifier = ctx.notifier.clone();
    match AssertUnwindSafe(reconnection::run(ctx, cancel))
        .catch_unwind()
        .await
    {
        Ok(result) => result.map_err(MonitorError::from),
        Err(panic) => {
            let reason = panic_message(&*panic);
            error!(reason = %reason, "monitor task panicked");
            notifier.set_state(ConnectionState::Failed {
                reason: reason.clone(),
            });
            Err(MonitorError::Panicked(reason))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Resilient client for the network event feed.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use network_monitor_connection::{Credentials, Endpoint, Monitor, MonitorConfig};
///
/// let monitor = Monitor::new(MonitorConfig::from_env()?)?;
/// monitor.subscribe("/topic/status", |event| {
///     println!("#{} {}", event.received_sequence, event.payload);
/// })?;
/// monitor
///     .start(Endpoint::from_env()?, Credentials::from_env())
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Monitor {
    config: Arc<MonitorConfig>,
    connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    dispatcher: Arc<Dispatcher>,
    notifier: Arc<Notifier>,
    events_rx: Mutex<Option<mpsc::Receiver<MonitorEvent>>>,
    running: Mutex<Option<Running>>,
}

impl Monitor {
    /// Creates a monitor that connects over secure WebSocket.
    pub fn new(config: MonitorConfig) -> Result<Self, ConfigError> {
        let connector = WsConnector::new().max_message_size(config.max_frame_size);
        Self::with_connector(config, Arc::new(connector))
    }

    /// Creates a monitor with a custom transport connector.
    pub fn with_connector(
        config: MonitorConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (notifier, events_rx) = Notifier::new(config.event_buffer);
        let registry = Arc::new(Registry::new());

        Ok(Self {
            config: Arc::new(config),
            connector,
            dispatcher: Arc::new(Dispatcher::new(registry.clone())),
            registry,
            notifier: Arc::new(notifier),
            events_rx: Mutex::new(Some(events_rx)),
            running: Mutex::new(None),
        })
    }

    /// Starts connecting in the background. Returns once the task is
    /// running; watch the state for `Connected`.
    pub async fn start(&self, endpoint: Endpoint, credentials: Credentials) -> Result<(), MonitorError> {
        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return Err(MonitorError::AlreadyRunning);
        }

        info!(url = %endpoint.url(), "starting monitor");
        let ctx = SessionContext {
            connector: self.connector.clone(),
            endpoint,
            credentials,
            config: self.config.clone(),
            registry: self.registry.clone(),
            dispatcher: self.dispatcher.clone(),
            notifier: self.notifier.clone(),
        };
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(ctx, cancel.clone()));
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    /// Stops the monitor, disconnecting gracefully if connected.
    ///
    /// Stopping a stopped monitor is a no-op. If the controller had already
    /// given up or crashed, that error is returned here and the `Failed`
    /// state is kept.
    pub async fn stop(&self) -> Result<(), MonitorError> {
        let Some(Running { cancel, handle }) = self.running.lock().await.take() else {
            return Ok(());
        };
        cancel.cancel();
        let result = match handle.await {
            Ok(result) => result,
            Err(e) => {
                error!("monitor task failed: {e}");
                self.notifier.set_state(ConnectionState::Failed {
                    reason: e.to_string(),
                });
                Err(MonitorError::Panicked(e.to_string()))
            }
        };
        if result.is_ok() {
            self.notifier.set_state(ConnectionState::Disconnected);
        }
        info!("monitor stopped");
        result
    }

    /// Registers interest in `destination`. Takes effect on the current
    /// session, or on the next one if not connected.
    pub fn subscribe<F>(
        &self,
        destination: impl Into<String>,
        callback: F,
    ) -> Result<SubscriptionId, SubscriptionError>
    where
        F: Fn(Event) + Send + Sync + 'static,
    {
        let destination = destination.into();
        let id = self.registry.subscribe(destination.clone(), Arc::new(callback))?;
        debug!(id = %id, destination = %destination, "subscribed");
        Ok(id)
    }

    /// Removes a subscription. Unknown ids are ignored; returns whether
    /// anything was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.registry.unsubscribe(id)
    }

    /// Publishes `body` as JSON to `destination` on the current session.
    pub fn send<T: Serialize>(&self, destination: &str, body: &T) -> Result<(), MonitorError> {
        if destination.trim().is_empty() {
            return Err(SubscriptionError::EmptyDestination.into());
        }
        if self.notifier.state() != ConnectionState::Connected {
            return Err(MonitorError::NotConnected);
        }
        let frame = Frame::new(Command::Send)
            .with_header(header::DESTINATION, destination)
            .with_json_body(body)?;
        if !self.registry.send(frame) {
            return Err(MonitorError::NotConnected);
        }
        trace!(destination, "SEND queued");
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.notifier.state()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.notifier.subscribe_state()
    }

    /// Takes the event receiver. Can only be called once.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<MonitorEvent>> {
        self.events_rx.lock().await.take()
    }

    /// `(id, destination)` of every registered subscription.
    pub fn subscriptions(&self) -> Vec<(SubscriptionId, String)> {
        self.registry.list()
    }

    /// Whether the background task is alive.
    pub async fn is_running(&self) -> bool {
        self.running
            .lock()
            .await
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}
