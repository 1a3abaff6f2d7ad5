//! Event source client and its connection worker.
//!
//! [`EventSource`] is the raw store-event source: listener registration and
//! close. All connection state lives in one spawned worker task that owns the
//! live transport adapter, the listener registry and the reconnect timers.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use reqwest::Url;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;
use crate::stream::cache::ServerEventsCache;
use crate::stream::fault::InactivityWatch;
use crate::stream::proto::{HealthPing, SupportedEvent};
use crate::stream::reconnect::{ConnectionState, FaultOutcome, ReconnectController, ReconnectReason};
use crate::stream::registry::{Listener, ListenerId, ListenerRegistry, MessageEvent};
use crate::stream::sse::SseConnector;
use crate::stream::transport::{
    Connector, SignalSink, TransportAdapter, TransportFrame, TransportSignal,
};
use crate::stream::ws::WsConnector;

/// Path of the server-sent events endpoint below the API base URL.
pub const SSE_PATH: &str = "/api/sse";
/// Path of the websocket endpoint below the API base URL.
pub const WS_PATH: &str = "/ws";

const ENV_RECONNECT_MS: &str = "SRAT_EVENTS_RECONNECT_MS";
const ENV_INACTIVITY_MS: &str = "SRAT_EVENTS_INACTIVITY_MS";
const ENV_FAULT_THRESHOLD: &str = "SRAT_EVENTS_FAULT_THRESHOLD";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EventStreamDefaults;

impl EventStreamDefaults {
    pub const FAULT_THRESHOLD: u32 = 3;
    pub const RECONNECT_DELAY: Duration = Duration::from_millis(5_000);
    pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(30);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SSE_RETRY_INTERVAL: Duration = Duration::from_secs(3);
    pub const SSE_MAX_ATTEMPTS: usize = 5;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventStreamOptions {
    /// Errors tolerated since the last open before the adapter is replaced.
    pub fault_threshold: u32,
    /// Fixed delay between arming a reconnect and replacing the adapter.
    pub reconnect_delay: Duration,
    /// Window in which some event must arrive. `None` disables the check.
    pub inactivity_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Redial spacing used by the SSE transport before it gives up.
    pub sse_retry: RetryPolicy,
    /// Keep cookies across requests, like `withCredentials` on an
    /// `EventSource`.
    pub with_credentials: bool,
}

impl Default for EventStreamOptions {
    fn default() -> Self {
        Self {
            fault_threshold: EventStreamDefaults::FAULT_THRESHOLD,
            reconnect_delay: EventStreamDefaults::RECONNECT_DELAY,
            inactivity_timeout: Some(EventStreamDefaults::INACTIVITY_TIMEOUT),
            connect_timeout: EventStreamDefaults::CONNECT_TIMEOUT,
            sse_retry: RetryPolicy::fixed(
                EventStreamDefaults::SSE_RETRY_INTERVAL,
                EventStreamDefaults::SSE_MAX_ATTEMPTS,
            ),
            with_credentials: true,
        }
    }
}

impl EventStreamOptions {
    /// Defaults overridden by `SRAT_EVENTS_RECONNECT_MS`,
    /// `SRAT_EVENTS_INACTIVITY_MS` (0 disables) and
    /// `SRAT_EVENTS_FAULT_THRESHOLD`. Unparseable values keep the default.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());

        if let Some(millis) = number(ENV_RECONNECT_MS) {
            self.reconnect_delay = Duration::from_millis(millis);
        }
        if let Some(millis) = number(ENV_INACTIVITY_MS) {
            self.inactivity_timeout = (millis > 0).then(|| Duration::from_millis(millis));
        }
        if let Some(threshold) = number(ENV_FAULT_THRESHOLD).and_then(|n| u32::try_from(n).ok()) {
            self.fault_threshold = threshold;
        }
        self
    }
}

/// Wire transport used to reach the backend.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum TransportKind {
    Sse,
    #[default]
    WebSocket,
}

/// Errors surfaced while constructing or starting an event stream. Runtime
/// faults never surface here; they turn into connection health instead.
#[derive(Debug, Error)]
pub enum EventStreamError {
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("event stream worker stopped before the first connection attempt")]
    WorkerStopped,
}

/// Entry point for opening event streams against one SRAT backend.
#[derive(Clone)]
pub struct EventStreamClient {
    base_url: String,
    transport: TransportKind,
    endpoint_override: Option<String>,
    options: EventStreamOptions,
    connector: Option<Arc<dyn Connector>>,
}

impl EventStreamClient {
    /// Creates a client for the API served at `base_url`, for example
    /// `http://homeassistant.local:8099`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            transport: TransportKind::default(),
            endpoint_override: None,
            options: EventStreamOptions::default(),
            connector: None,
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    /// Sets an explicit stream endpoint. It takes precedence over the one
    /// derived from the base URL.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint_override = Some(endpoint.into().trim().to_string());
        self
    }

    pub fn with_options(mut self, options: EventStreamOptions) -> Self {
        self.options = options;
        self
    }

    /// Uses a custom connector instead of the one picked by the transport
    /// kind.
    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn options(&self) -> &EventStreamOptions {
        &self.options
    }

    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    pub fn endpoint(&self) -> Result<String, EventStreamError> {
        if let Some(endpoint) = &self.endpoint_override {
            validate_url(endpoint)?;
            return Ok(endpoint.clone());
        }

        validate_url(&self.base_url)?;
        Ok(match self.transport {
            TransportKind::Sse => format!("{}{SSE_PATH}", self.base_url),
            TransportKind::WebSocket => {
                let base = self
                    .base_url
                    .strip_prefix("http")
                    .map(|rest| format!("ws{rest}"))
                    .unwrap_or_else(|| self.base_url.clone());
                format!("{base}{WS_PATH}")
            }
        })
    }

    /// Opens a raw event source. Must be called inside a tokio runtime.
    pub fn open(&self) -> Result<EventSource, EventStreamError> {
        let endpoint = self.endpoint()?;
        let connector: Arc<dyn Connector> = match &self.connector {
            Some(connector) => Arc::clone(connector),
            None => match self.transport {
                TransportKind::Sse => Arc::new(SseConnector::new(&self.options)?),
                TransportKind::WebSocket => Arc::new(WsConnector::new(&self.options)),
            },
        };
        Ok(EventSource::spawn(connector, endpoint, &self.options))
    }

    /// Creates a reference-counted cache over this client's stream.
    pub fn cache(&self) -> ServerEventsCache {
        ServerEventsCache::new(self.clone())
    }
}

impl fmt::Debug for EventStreamClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStreamClient")
            .field("base_url", &self.base_url)
            .field("transport", &self.transport)
            .field("endpoint_override", &self.endpoint_override)
            .field("options", &self.options)
            .field("custom_connector", &self.connector.is_some())
            .finish()
    }
}

fn validate_url(url: &str) -> Result<(), EventStreamError> {
    let parsed = Url::parse(url).map_err(|err| EventStreamError::InvalidEndpoint(format!("{url}: {err}")))?;
    match parsed.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(()),
        scheme => Err(EventStreamError::InvalidEndpoint(format!(
            "{url}: unsupported scheme `{scheme}`"
        ))),
    }
}

/// Snapshot of the connection as published by the worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionHealth {
    pub state: ConnectionState,
    pub faults: u32,
    /// Number of adapters constructed so far; 0 until the first one.
    pub generation: u64,
    pub last_error: Option<String>,
    /// Set once the event source has been torn down.
    pub closed: bool,
}

impl ConnectionHealth {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Reconnecting,
            faults: 0,
            generation: 0,
            last_error: None,
            closed: false,
        }
    }

    /// True while no usable adapter is in place: before the first open,
    /// while a reconnect is pending or running, and after teardown. Faults
    /// below the threshold do not count.
    pub fn is_loading(&self) -> bool {
        self.closed
            || matches!(
                self.state,
                ConnectionState::Reconnecting | ConnectionState::ReconnectPending
            )
    }
}

enum Command {
    Listen {
        event: SupportedEvent,
        id: ListenerId,
        listener: Listener,
    },
    Unlisten {
        event: SupportedEvent,
        id: ListenerId,
    },
    Close,
}

/// Long-lived event source with automatic reconnection.
///
/// Listeners run on the worker task, in registration order, and survive
/// adapter replacement.
pub struct EventSource {
    commands: mpsc::UnboundedSender<Command>,
    next_listener: AtomicU64,
    health: watch::Receiver<ConnectionHealth>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EventSource {
    /// Starts a worker that connects through `connector` right away.
    pub fn spawn(connector: Arc<dyn Connector>, endpoint: String, options: &EventStreamOptions) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (health_tx, health_rx) = watch::channel(ConnectionHealth::initial());

        let worker = ConnectionWorker {
            connector,
            endpoint,
            registry: ListenerRegistry::new(),
            adapter: None,
            controller: ReconnectController::new(options.fault_threshold, options.reconnect_delay),
            inactivity: InactivityWatch::new(options.inactivity_timeout),
            generation: 0,
            frames_tx,
            health: health_tx,
            last_error: None,
        };
        let task = tokio::spawn(worker.run(commands_rx, frames_rx));

        Self {
            commands: commands_tx,
            next_listener: AtomicU64::new(1),
            health: health_rx,
            worker: Mutex::new(Some(task)),
        }
    }

    pub fn add_event_listener<F>(&self, event: SupportedEvent, listener: F) -> ListenerId
    where
        F: Fn(&MessageEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        let _ = self.commands.send(Command::Listen {
            event,
            id,
            listener: Arc::new(listener),
        });
        id
    }

    pub fn remove_event_listener(&self, event: SupportedEvent, id: ListenerId) {
        let _ = self.commands.send(Command::Unlisten { event, id });
    }

    /// Requests teardown. Safe to call any number of times.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close);
    }

    /// Closes the source and returns a future that resolves once the worker
    /// has released the transport and cleared its timers.
    pub fn close_and_join(&self) -> impl Future<Output = ()> + Send + 'static {
        self.close();
        let task = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        async move {
            if let Some(task) = task {
                let _ = task.await;
            }
        }
    }

    pub async fn shutdown(self) {
        self.close_and_join().await;
    }

    pub fn health(&self) -> watch::Receiver<ConnectionHealth> {
        self.health.clone()
    }

    /// Resolves once the worker has constructed its first adapter.
    pub async fn ready(&self) -> Result<(), EventStreamError> {
        let mut health = self.health.clone();
        health
            .wait_for(|health| health.generation > 0)
            .await
            .map(|_| ())
            .map_err(|_| EventStreamError::WorkerStopped)
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("health", &*self.health.borrow())
            .finish()
    }
}

struct ConnectionWorker {
    connector: Arc<dyn Connector>,
    endpoint: String,
    registry: ListenerRegistry,
    adapter: Option<TransportAdapter>,
    controller: ReconnectController,
    inactivity: InactivityWatch,
    generation: u64,
    frames_tx: mpsc::UnboundedSender<TransportFrame>,
    health: watch::Sender<ConnectionHealth>,
    last_error: Option<String>,
}

impl ConnectionWorker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut frames: mpsc::UnboundedReceiver<TransportFrame>,
    ) {
        self.replace_adapter();

        loop {
            let reconnect_at = self.controller.pending_deadline();
            let idle_at = self.inactivity.deadline();

            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(Command::Listen { event, id, listener }) => self.listen(event, id, listener),
                    Some(Command::Unlisten { event, id }) => self.unlisten(event, id),
                    Some(Command::Close) | None => break,
                },
                Some(frame) = frames.recv() => self.handle_frame(frame),
                _ = sleep_until(reconnect_at) => self.fire_reconnect(),
                _ = sleep_until(idle_at) => self.on_inactivity(),
            }
        }

        self.teardown();
    }

    fn listen(&mut self, event: SupportedEvent, id: ListenerId, listener: Listener) {
        self.registry.register(event, id, Arc::clone(&listener));
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.add_event_listener(event, id, listener);
        }
        debug!(event = "listener_added", stream_event = %event, listener_id = id.0);
    }

    fn unlisten(&mut self, event: SupportedEvent, id: ListenerId) {
        let removed = self.registry.unregister(event, id);
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.remove_event_listener(event, id);
        }
        debug!(event = "listener_removed", stream_event = %event, listener_id = id.0, removed);
    }

    fn replace_adapter(&mut self) {
        if let Some(mut previous) = self.adapter.take() {
            previous.close();
        }
        self.generation += 1;
        self.inactivity.clear();

        let sink = SignalSink::new(self.generation, self.frames_tx.clone());
        self.adapter = Some(TransportAdapter::open(
            self.connector.as_ref(),
            &self.endpoint,
            sink,
        ));
        info!(
            event = "transport_adapter_created",
            generation = self.generation,
            endpoint = %self.endpoint
        );
        self.publish_health();
    }

    fn handle_frame(&mut self, frame: TransportFrame) {
        if frame.generation != self.generation {
            debug!(
                event = "stale_frame_discarded",
                frame_generation = frame.generation,
                generation = self.generation
            );
            return;
        }

        match frame.signal {
            TransportSignal::Open => self.on_open(),
            TransportSignal::Error(reason) => self.on_error(reason),
            TransportSignal::Closed(reason) => self.on_closed(reason),
            TransportSignal::Event { name, data, id } => self.on_event(name, data, id),
        }
    }

    fn on_open(&mut self) {
        let cancelled_reconnect = self.controller.on_open();
        if let Some(adapter) = self.adapter.as_mut() {
            adapter.reattach(&self.registry);
        }
        self.inactivity.touch(Instant::now());
        self.last_error = None;
        info!(
            event = "transport_open",
            generation = self.generation,
            cancelled_reconnect
        );
        self.publish_health();
    }

    fn on_error(&mut self, reason: String) {
        let outcome = self.controller.on_error(Instant::now());
        warn!(
            event = "transport_error",
            generation = self.generation,
            faults = self.controller.faults(),
            reason = %reason
        );
        self.signal_not_alive();
        if let FaultOutcome::ReconnectArmed { .. } = outcome {
            self.log_reconnect_scheduled(ReconnectReason::FaultThreshold);
        }
        self.last_error = Some(reason);
        self.publish_health();
    }

    fn on_closed(&mut self, reason: String) {
        warn!(
            event = "transport_closed_by_peer",
            generation = self.generation,
            reason = %reason
        );
        self.inactivity.clear();
        self.signal_not_alive();
        if self.controller.schedule(Instant::now()).is_some() {
            self.log_reconnect_scheduled(ReconnectReason::TransportClosed);
        }
        self.last_error = Some(reason);
        self.publish_health();
    }

    fn on_event(&mut self, name: String, data: String, id: Option<String>) {
        self.inactivity.touch(Instant::now());

        let event = match name.parse::<SupportedEvent>() {
            Ok(event) => event,
            Err(err) => {
                error!(
                    event = "unsupported_event_dropped",
                    generation = self.generation,
                    event_id = id.as_deref().unwrap_or_default(),
                    error = %err
                );
                return;
            }
        };
        if let Some(adapter) = &self.adapter {
            adapter.dispatch(&MessageEvent::received(event, data, id));
        }
    }

    fn on_inactivity(&mut self) {
        self.inactivity.clear();
        warn!(event = "transport_inactive", generation = self.generation);
        if self.controller.schedule(Instant::now()).is_some() {
            self.log_reconnect_scheduled(ReconnectReason::Inactivity);
        }
        self.publish_health();
    }

    fn fire_reconnect(&mut self) {
        if !self.controller.fire(Instant::now()) {
            return;
        }
        info!(event = "reconnecting", generation = self.generation);
        self.replace_adapter();
    }

    /// Tells liveness listeners right away that the backend is unreachable,
    /// without waiting for the reconnect threshold.
    fn signal_not_alive(&self) {
        let message = MessageEvent::synthetic(SupportedEvent::LIVENESS, HealthPing::NOT_ALIVE_JSON);
        self.registry.dispatch(&message);
    }

    fn log_reconnect_scheduled(&self, reason: ReconnectReason) {
        let delay_ms = self
            .controller
            .pending_deadline()
            .map(|at| at.saturating_duration_since(Instant::now()).as_millis() as u64)
            .unwrap_or_default();
        info!(
            event = "reconnect_scheduled",
            generation = self.generation,
            reason = %reason,
            delay_ms
        );
    }

    fn teardown(&mut self) {
        if let Some(mut adapter) = self.adapter.take() {
            adapter.close();
        }
        self.controller.cancel();
        self.inactivity.clear();
        self.registry = ListenerRegistry::new();
        info!(event = "event_source_closed", generation = self.generation);

        let generation = self.generation;
        let faults = self.controller.faults();
        self.health.send_modify(|health| {
            health.generation = generation;
            health.faults = faults;
            health.closed = true;
        });
    }

    fn publish_health(&self) {
        let next = ConnectionHealth {
            state: self.controller.state(),
            faults: self.controller.faults(),
            generation: self.generation,
            last_error: self.last_error.clone(),
            closed: false,
        };
        self.health.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
