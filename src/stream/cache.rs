//! Reference-counted subscription cache over one event source.
//!
//! The first subscriber opens the connection, later ones share it, and the
//! last one to leave tears it down. A subscribe that races a teardown waits
//! for the teardown to finish before opening a fresh connection.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::stream::client::{ConnectionHealth, EventSource, EventStreamClient, EventStreamError};
use crate::stream::multiplexer::{EventDocument, Multiplexer};

type Teardown = Shared<BoxFuture<'static, ()>>;

/// What a consumer sees when it reads the cache.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult {
    /// `None` once the connection behind the subscription is gone.
    pub data: Option<EventDocument>,
    /// True until the live adapter reports open, and again while it is being
    /// replaced. Transient faults leave it false.
    pub is_loading: bool,
}

#[derive(Clone)]
pub struct ServerEventsCache {
    inner: Arc<CacheInner>,
}

struct CacheInner {
    client: EventStreamClient,
    state: Mutex<CacheState>,
}

#[derive(Default)]
struct CacheState {
    subscribers: usize,
    live: Option<LiveConnection>,
    teardown: Option<Teardown>,
}

struct LiveConnection {
    source: EventSource,
    multiplexer: Multiplexer,
}

impl ServerEventsCache {
    pub fn new(client: EventStreamClient) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                client,
                state: Mutex::new(CacheState::default()),
            }),
        }
    }

    /// Registers a subscriber, opening the connection if this is the first
    /// one. Resolves once the connection has constructed its first adapter.
    pub async fn subscribe(&self) -> Result<Subscription, EventStreamError> {
        let (document, health) = loop {
            let pending = {
                let mut state = self.inner.lock();
                match state.teardown.clone() {
                    Some(teardown) if teardown.peek().is_none() => teardown,
                    _ => {
                        state.teardown = None;
                        break self.inner.acquire(&mut state)?;
                    }
                }
            };
            debug!(event = "subscribe_waiting_for_teardown");
            pending.await;
        };

        let mut subscription = Subscription {
            cache: Arc::clone(&self.inner),
            document,
            health,
            released: false,
        };
        subscription.ready().await?;
        Ok(subscription)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers
    }

    /// True while a connection exists, which is exactly while at least one
    /// subscription is held.
    pub fn is_connected(&self) -> bool {
        self.inner.lock().live.is_some()
    }
}

impl fmt::Debug for ServerEventsCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("ServerEventsCache")
            .field("subscribers", &state.subscribers)
            .field("connected", &state.live.is_some())
            .field("tearing_down", &state.teardown.is_some())
            .finish()
    }
}

impl CacheInner {
    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(
        &self,
        state: &mut CacheState,
    ) -> Result<(watch::Receiver<EventDocument>, watch::Receiver<ConnectionHealth>), EventStreamError>
    {
        let live = match state.live.take() {
            Some(live) => live,
            None => {
                let source = self.client.open()?;
                let multiplexer = Multiplexer::attach(&source);
                info!(event = "server_events_connection_created");
                LiveConnection {
                    source,
                    multiplexer,
                }
            }
        };
        let receivers = (live.multiplexer.document(), live.source.health());
        state.live = Some(live);
        state.subscribers += 1;
        debug!(event = "subscriber_added", subscribers = state.subscribers);
        Ok(receivers)
    }

    /// Drops one subscriber. Returns the teardown future when it was the
    /// last one.
    fn release(&self) -> Option<Teardown> {
        let mut state = self.lock();
        state.subscribers = state.subscribers.saturating_sub(1);
        debug!(event = "subscriber_removed", subscribers = state.subscribers);
        if state.subscribers > 0 {
            return None;
        }

        let live = state.live.take()?;
        live.multiplexer.detach(&live.source);
        let teardown = live.source.close_and_join().boxed().shared();
        state.teardown = Some(teardown.clone());
        info!(event = "server_events_connection_released");
        Some(teardown)
    }
}

/// One consumer's handle on the cache. Dropping it releases the
/// subscription without waiting for teardown.
pub struct Subscription {
    cache: Arc<CacheInner>,
    document: watch::Receiver<EventDocument>,
    health: watch::Receiver<ConnectionHealth>,
    released: bool,
}

impl Subscription {
    pub fn query(&self) -> QueryResult {
        let health = self.health.borrow().clone();
        let data = (!health.closed).then(|| self.document.borrow().clone());
        QueryResult {
            data,
            is_loading: health.is_loading(),
        }
    }

    pub fn document(&self) -> EventDocument {
        self.document.borrow().clone()
    }

    pub fn health(&self) -> ConnectionHealth {
        self.health.borrow().clone()
    }

    /// Waits until the document or the connection health changes. Returns
    /// false once the connection is gone and nothing will change anymore.
    pub async fn changed(&mut self) -> bool {
        tokio::select! {
            result = self.document.changed() => result.is_ok(),
            result = self.health.changed() => result.is_ok(),
        }
    }

    /// Releases the subscription. When it was the last one, waits until the
    /// connection is fully torn down.
    pub async fn unsubscribe(mut self) {
        self.released = true;
        if let Some(teardown) = self.cache.release() {
            teardown.await;
        }
    }

    async fn ready(&mut self) -> Result<(), EventStreamError> {
        self.health
            .wait_for(|health| health.generation > 0)
            .await
            .map(|_| ())
            .map_err(|_| EventStreamError::WorkerStopped)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.cache.release();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("health", &*self.health.borrow())
            .field("released", &self.released)
            .finish()
    }
}
