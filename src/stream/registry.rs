//! Listener bookkeeping shared by the event source and its transport
//! adapters.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::stream::proto::SupportedEvent;

/// Message handed to listeners for one named event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageEvent {
    pub event: SupportedEvent,
    pub data: String,
    pub last_event_id: Option<String>,
    /// Set when the message was produced locally instead of received.
    pub synthetic: bool,
}

impl MessageEvent {
    pub fn received(event: SupportedEvent, data: String, last_event_id: Option<String>) -> Self {
        Self {
            event,
            data,
            last_event_id,
            synthetic: false,
        }
    }

    pub(crate) fn synthetic(event: SupportedEvent, data: &str) -> Self {
        Self {
            event,
            data: data.to_string(),
            last_event_id: None,
            synthetic: true,
        }
    }
}

/// Callback invoked for every matching event.
pub type Listener = Arc<dyn Fn(&MessageEvent) + Send + Sync>;

/// Handle returned on registration and used to remove a listener.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ListenerId(pub u64);

/// Ordered map of event name to listeners, kept in registration order.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    entries: BTreeMap<SupportedEvent, Vec<(ListenerId, Listener)>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener. Registering an id that is already present for the
    /// same event is ignored.
    pub fn register(&mut self, event: SupportedEvent, id: ListenerId, listener: Listener) -> bool {
        let listeners = self.entries.entry(event).or_default();
        if listeners.iter().any(|(existing, _)| *existing == id) {
            return false;
        }
        listeners.push((id, listener));
        true
    }

    pub fn unregister(&mut self, event: SupportedEvent, id: ListenerId) -> bool {
        let Some(listeners) = self.entries.get_mut(&event) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        let removed = listeners.len() != before;
        if listeners.is_empty() {
            self.entries.remove(&event);
        }
        removed
    }

    pub fn listeners(&self, event: SupportedEvent) -> impl Iterator<Item = &Listener> + '_ {
        self.entries
            .get(&event)
            .into_iter()
            .flat_map(|listeners| listeners.iter().map(|(_, listener)| listener))
    }

    /// Invokes the listeners for `message.event` in registration order and
    /// returns how many ran.
    pub fn dispatch(&self, message: &MessageEvent) -> usize {
        let mut delivered = 0;
        for listener in self.listeners(message.event) {
            listener(message);
            delivered += 1;
        }
        delivered
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(event, listeners)| (event, listeners.len())),
            )
            .finish()
    }
}
