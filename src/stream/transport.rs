//! Transport adapter seam shared by the SSE and websocket connectors.
//!
//! A [`Connector`] opens one underlying connection immediately and reports
//! what happens to it as [`TransportSignal`]s. Every signal is stamped with
//! the generation of the adapter that produced it, so the connection worker
//! can drop frames from an adapter it already replaced.

use std::fmt;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::stream::proto::SupportedEvent;
use crate::stream::registry::{Listener, ListenerId, ListenerRegistry, MessageEvent};

/// Lifecycle and data signals reported by a transport.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransportSignal {
    Open,
    /// Transient failure. The transport may still recover on its own.
    Error(String),
    /// The transport is finished and will not produce further signals.
    Closed(String),
    Event {
        name: String,
        data: String,
        id: Option<String>,
    },
}

/// A signal tagged with the generation of the adapter that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportFrame {
    pub generation: u64,
    pub signal: TransportSignal,
}

/// Where a transport delivers its signals.
#[derive(Clone, Debug)]
pub struct SignalSink {
    generation: u64,
    tx: mpsc::UnboundedSender<TransportFrame>,
}

impl SignalSink {
    pub fn new(generation: u64, tx: mpsc::UnboundedSender<TransportFrame>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Delivers a signal. Returns false once nobody is listening anymore, in
    /// which case the transport should stop.
    pub fn send(&self, signal: TransportSignal) -> bool {
        self.tx
            .send(TransportFrame {
                generation: self.generation,
                signal,
            })
            .is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A live underlying connection.
pub trait Transport: Send {
    /// Releases the connection. Only ever called once per transport.
    fn close(&mut self);
}

/// Opens transports to an endpoint. Implementations must start connecting
/// right away rather than on first use.
pub trait Connector: Send + Sync {
    fn connect(&self, endpoint: &str, sink: SignalSink) -> Box<dyn Transport>;
}

/// Transport backed by a spawned task that owns the socket.
#[derive(Debug)]
pub struct TaskTransport {
    task: JoinHandle<()>,
}

impl TaskTransport {
    pub fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }
}

impl Transport for TaskTransport {
    fn close(&mut self) {
        self.task.abort();
    }
}

/// One transport instance plus the listeners attached to it.
pub struct TransportAdapter {
    generation: u64,
    transport: Box<dyn Transport>,
    listeners: ListenerRegistry,
    closed: bool,
}

impl TransportAdapter {
    /// Connects immediately through `connector`.
    pub fn open(connector: &dyn Connector, endpoint: &str, sink: SignalSink) -> Self {
        let generation = sink.generation();
        Self {
            generation,
            transport: connector.connect(endpoint, sink),
            listeners: ListenerRegistry::new(),
            closed: false,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn add_event_listener(&mut self, event: SupportedEvent, id: ListenerId, listener: Listener) {
        self.listeners.register(event, id, listener);
    }

    pub fn remove_event_listener(&mut self, event: SupportedEvent, id: ListenerId) -> bool {
        self.listeners.unregister(event, id)
    }

    /// Replaces the attached listeners with every listener in `registry`,
    /// keeping per-event registration order.
    pub fn reattach(&mut self, registry: &ListenerRegistry) {
        self.listeners = registry.clone();
        debug!(
            event = "listeners_reattached",
            generation = self.generation,
            listeners = self.listeners.len()
        );
    }

    pub fn dispatch(&self, message: &MessageEvent) -> usize {
        if self.closed {
            return 0;
        }
        self.listeners.dispatch(message)
    }

    /// Closes the transport. Returns false when it was already closed.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.transport.close();
        debug!(event = "transport_closed", generation = self.generation);
        true
    }
}

impl Drop for TransportAdapter {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TransportAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportAdapter")
            .field("generation", &self.generation)
            .field("listeners", &self.listeners)
            .field("closed", &self.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct CountingConnector {
        closes: Arc<AtomicUsize>,
        endpoints: Mutex<Vec<String>>,
    }

    struct CountingTransport {
        closes: Arc<AtomicUsize>,
    }

    impl Transport for CountingTransport {
        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Connector for CountingConnector {
        fn connect(&self, endpoint: &str, _sink: SignalSink) -> Box<dyn Transport> {
            self.endpoints
                .lock()
                .expect("endpoints")
                .push(endpoint.to_string());
            Box::new(CountingTransport {
                closes: Arc::clone(&self.closes),
            })
        }
    }

    fn sink(generation: u64) -> (SignalSink, mpsc::UnboundedReceiver<TransportFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SignalSink::new(generation, tx), rx)
    }

    #[test]
    fn open_connects_immediately() {
        let connector = CountingConnector::default();
        let (sink, _rx) = sink(1);
        let adapter = TransportAdapter::open(&connector, "ws://nas.local/ws", sink);
        assert_eq!(adapter.generation(), 1);
        assert_eq!(
            *connector.endpoints.lock().expect("endpoints"),
            vec!["ws://nas.local/ws".to_string()]
        );
    }

    #[test]
    fn close_releases_the_transport_once() {
        let connector = CountingConnector::default();
        let (sink, _rx) = sink(1);
        let mut adapter = TransportAdapter::open(&connector, "ws://nas.local/ws", sink);

        assert!(adapter.close());
        assert!(!adapter.close());
        assert!(!adapter.close());
        drop(adapter);

        assert_eq!(connector.closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closed_adapter_stops_dispatching() {
        let connector = CountingConnector::default();
        let (sink, _rx) = sink(1);
        let mut adapter = TransportAdapter::open(&connector, "ws://nas.local/ws", sink);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        adapter.add_event_listener(
            SupportedEvent::Hello,
            ListenerId(1),
            Arc::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        let hello = MessageEvent::received(SupportedEvent::Hello, "{}".to_string(), None);

        assert_eq!(adapter.dispatch(&hello), 1);
        adapter.close();
        assert_eq!(adapter.dispatch(&hello), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sink_stamps_generation_and_reports_closed_receiver() {
        let (sink, mut rx) = sink(4);
        assert!(sink.send(TransportSignal::Open));
        assert_eq!(
            rx.try_recv().expect("frame"),
            TransportFrame {
                generation: 4,
                signal: TransportSignal::Open
            }
        );

        drop(rx);
        assert!(sink.is_closed());
        assert!(!sink.send(TransportSignal::Error("gone".to_string())));
    }
}
