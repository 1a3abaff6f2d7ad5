//! Folds named events into one typed [`EventDocument`].

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tracing::warn;

use crate::stream::client::EventSource;
use crate::stream::proto::{
    decode_payload, EventPayload, HealthPing, SupportedEvent, UpdateProgress, Welcome,
};
use crate::stream::registry::{ListenerId, MessageEvent};

/// Latest payload for every supported event. A field stays `None` until its
/// first event arrives.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct EventDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hello: Option<Welcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HealthPing>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updating: Option<UpdateProgress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dirty_data_tracker: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smart_test_status: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesystem_task: Option<Value>,
}

impl EventDocument {
    /// Replaces the whole value stored for the payload's event.
    pub fn apply(&mut self, payload: EventPayload) {
        match payload {
            EventPayload::Hello(value) => self.hello = Some(value),
            EventPayload::Heartbeat(value) => self.heartbeat = Some(value),
            EventPayload::Volumes(value) => self.volumes = Some(value),
            EventPayload::Shares(value) => self.shares = Some(value),
            EventPayload::Updating(value) => self.updating = Some(value),
            EventPayload::DirtyDataTracker(value) => self.dirty_data_tracker = Some(value),
            EventPayload::SmartTestStatus(value) => self.smart_test_status = Some(value),
            EventPayload::FilesystemTask(value) => self.filesystem_task = Some(value),
        }
    }

    pub fn contains(&self, event: SupportedEvent) -> bool {
        match event {
            SupportedEvent::Hello => self.hello.is_some(),
            SupportedEvent::Heartbeat => self.heartbeat.is_some(),
            SupportedEvent::Volumes => self.volumes.is_some(),
            SupportedEvent::Shares => self.shares.is_some(),
            SupportedEvent::Updating => self.updating.is_some(),
            SupportedEvent::DirtyDataTracker => self.dirty_data_tracker.is_some(),
            SupportedEvent::SmartTestStatus => self.smart_test_status.is_some(),
            SupportedEvent::FilesystemTask => self.filesystem_task.is_some(),
        }
    }

    pub fn is_empty(&self) -> bool {
        SupportedEvent::ALL.into_iter().all(|event| !self.contains(event))
    }
}

/// Keeps an [`EventDocument`] in sync with an [`EventSource`].
#[derive(Debug)]
pub struct Multiplexer {
    document: Arc<watch::Sender<EventDocument>>,
    listeners: Vec<(SupportedEvent, ListenerId)>,
}

impl Multiplexer {
    /// Registers one decoding listener per supported event on `source`.
    pub fn attach(source: &EventSource) -> Self {
        let (document, _) = watch::channel(EventDocument::default());
        let document = Arc::new(document);

        let listeners = SupportedEvent::ALL
            .into_iter()
            .map(|event| {
                let document = Arc::clone(&document);
                let id = source.add_event_listener(event, move |message| {
                    apply_message(&document, message);
                });
                (event, id)
            })
            .collect();

        Self {
            document,
            listeners,
        }
    }

    pub fn document(&self) -> watch::Receiver<EventDocument> {
        self.document.subscribe()
    }

    /// Removes this multiplexer's listeners from `source`.
    pub fn detach(&self, source: &EventSource) {
        for (event, id) in &self.listeners {
            source.remove_event_listener(*event, *id);
        }
    }
}

/// Decodes one message and writes it into the document. A payload that fails
/// to decode leaves the document untouched.
pub(crate) fn apply_message(document: &watch::Sender<EventDocument>, message: &MessageEvent) {
    match decode_payload(message.event, &message.data) {
        Ok(payload) => document.send_modify(|current| current.apply(payload)),
        Err(err) => warn!(
            event = "payload_decode_failed",
            stream_event = %message.event,
            synthetic = message.synthetic,
            error = %err
        ),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn message(event: SupportedEvent, data: &str) -> MessageEvent {
        MessageEvent::received(event, data.to_string(), None)
    }

    #[test]
    fn later_event_replaces_the_whole_value() {
        let (tx, rx) = watch::channel(EventDocument::default());
        apply_message(&tx, &message(SupportedEvent::Shares, r#"[{"name":"a"}]"#));
        apply_message(&tx, &message(SupportedEvent::Shares, r#"[{"name":"b"}]"#));

        assert_eq!(rx.borrow().shares, Some(vec![json!({"name": "b"})]));
        assert!(!rx.borrow().contains(SupportedEvent::Volumes));
    }

    #[test]
    fn bad_payload_leaves_other_keys_intact() {
        let (tx, rx) = watch::channel(EventDocument::default());
        apply_message(&tx, &message(SupportedEvent::Volumes, r#"[{"disk":"sda"}]"#));
        apply_message(&tx, &message(SupportedEvent::Shares, r#"[{"name":"a"}]"#));
        apply_message(&tx, &message(SupportedEvent::Shares, "{not json"));

        let document = rx.borrow();
        assert_eq!(document.volumes, Some(vec![json!({"disk": "sda"})]));
        assert_eq!(document.shares, Some(vec![json!({"name": "a"})]));
    }

    #[test]
    fn synthetic_heartbeat_marks_backend_not_alive() {
        let (tx, rx) = watch::channel(EventDocument::default());
        apply_message(&tx, &message(SupportedEvent::Heartbeat, r#"{"alive":true}"#));
        apply_message(
            &tx,
            &MessageEvent::synthetic(SupportedEvent::Heartbeat, HealthPing::NOT_ALIVE_JSON),
        );

        let heartbeat = rx.borrow().heartbeat.clone().expect("heartbeat");
        assert!(!heartbeat.alive);
        assert!(heartbeat.read_only);
    }

    #[test]
    fn empty_document_serializes_without_keys() {
        let document = EventDocument::default();
        assert!(document.is_empty());
        assert_eq!(serde_json::to_value(&document).expect("serialize"), json!({}));
    }
}
