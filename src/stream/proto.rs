use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Event names the SRAT backend publishes on its event stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupportedEvent {
    Hello,
    Heartbeat,
    Volumes,
    Shares,
    Updating,
    DirtyDataTracker,
    SmartTestStatus,
    FilesystemTask,
}

impl SupportedEvent {
    /// Every supported event, in registration order.
    pub const ALL: [SupportedEvent; 8] = [
        SupportedEvent::Hello,
        SupportedEvent::Heartbeat,
        SupportedEvent::Volumes,
        SupportedEvent::Shares,
        SupportedEvent::Updating,
        SupportedEvent::DirtyDataTracker,
        SupportedEvent::SmartTestStatus,
        SupportedEvent::FilesystemTask,
    ];

    /// Event whose `alive` flag drives connection health indicators.
    pub const LIVENESS: SupportedEvent = SupportedEvent::Heartbeat;

    /// Wire name used on both the SSE and websocket transports.
    pub fn as_str(self) -> &'static str {
        match self {
            SupportedEvent::Hello => "hello",
            SupportedEvent::Heartbeat => "heartbeat",
            SupportedEvent::Volumes => "volumes",
            SupportedEvent::Shares => "shares",
            SupportedEvent::Updating => "updating",
            SupportedEvent::DirtyDataTracker => "dirty_data_tracker",
            SupportedEvent::SmartTestStatus => "smart_test_status",
            SupportedEvent::FilesystemTask => "filesystem_task",
        }
    }
}

impl fmt::Display for SupportedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a wire name is outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unsupported event type `{0}`")]
pub struct UnsupportedEvent(pub String);

impl FromStr for SupportedEvent {
    type Err = UnsupportedEvent;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        SupportedEvent::ALL
            .into_iter()
            .find(|event| event.as_str() == name)
            .ok_or_else(|| UnsupportedEvent(name.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Welcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub supported_events: Vec<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct HealthPing {
    #[serde(default)]
    pub alive: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl HealthPing {
    /// Payload delivered to liveness listeners when the transport reports an
    /// error, ahead of any real heartbeat timeout.
    pub const NOT_ALIVE_JSON: &'static str = r#"{ "alive": false, "read_only": true }"#;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct UpdateProgress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_process_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_release: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Decoded payload tagged with the event it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    Hello(Welcome),
    Heartbeat(HealthPing),
    Volumes(Vec<Value>),
    Shares(Vec<Value>),
    Updating(UpdateProgress),
    DirtyDataTracker(Value),
    SmartTestStatus(Value),
    FilesystemTask(Value),
}

/// A payload that could not be decoded for its event.
#[derive(Debug, Error)]
#[error("invalid `{event}` payload: {source}")]
pub struct PayloadError {
    pub event: SupportedEvent,
    #[source]
    pub source: serde_json::Error,
}

/// Decodes the JSON payload of one event into its fixed payload type.
pub fn decode_payload(event: SupportedEvent, data: &str) -> Result<EventPayload, PayloadError> {
    let wrap = |source| PayloadError { event, source };
    let payload = match event {
        SupportedEvent::Hello => EventPayload::Hello(serde_json::from_str(data).map_err(wrap)?),
        SupportedEvent::Heartbeat => {
            EventPayload::Heartbeat(serde_json::from_str(data).map_err(wrap)?)
        }
        SupportedEvent::Volumes => EventPayload::Volumes(serde_json::from_str(data).map_err(wrap)?),
        SupportedEvent::Shares => EventPayload::Shares(serde_json::from_str(data).map_err(wrap)?),
        SupportedEvent::Updating => {
            EventPayload::Updating(serde_json::from_str(data).map_err(wrap)?)
        }
        SupportedEvent::DirtyDataTracker => {
            EventPayload::DirtyDataTracker(serde_json::from_str(data).map_err(wrap)?)
        }
        SupportedEvent::SmartTestStatus => {
            EventPayload::SmartTestStatus(serde_json::from_str(data).map_err(wrap)?)
        }
        SupportedEvent::FilesystemTask => {
            EventPayload::FilesystemTask(serde_json::from_str(data).map_err(wrap)?)
        }
    };
    Ok(payload)
}

const FRAME_ID_TAG: &str = "id: ";
const FRAME_EVENT_TAG: &str = "event: ";
const FRAME_DATA_TAG: &str = "data: ";

/// Errors produced while splitting a websocket text frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame has {0} segments, expected id, event and data")]
    MissingSegments(usize),

    #[error("frame segment is missing the `{0}` tag")]
    MissingTag(&'static str),
}

/// Envelope used by the websocket transport: `id`, `event` and `data`
/// lines, each carrying a literal tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketFrame {
    pub id: String,
    pub event: String,
    pub data: String,
}

impl SocketFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let segments: Vec<&str> = text
            .split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .filter(|line| !line.is_empty())
            .collect();
        let [id, event, data, ..] = segments.as_slice() else {
            return Err(FrameError::MissingSegments(segments.len()));
        };

        Ok(Self {
            id: strip_tag(id, FRAME_ID_TAG)?,
            event: strip_tag(event, FRAME_EVENT_TAG)?,
            data: strip_tag(data, FRAME_DATA_TAG)?,
        })
    }

    pub fn to_text(&self) -> String {
        format!(
            "{FRAME_ID_TAG}{}\n{FRAME_EVENT_TAG}{}\n{FRAME_DATA_TAG}{}\n\n",
            self.id, self.event, self.data
        )
    }
}

fn strip_tag(segment: &str, tag: &'static str) -> Result<String, FrameError> {
    segment
        .strip_prefix(tag)
        .map(str::to_string)
        .ok_or(FrameError::MissingTag(tag.trim_end()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn supported_event_names_match_wire_names() {
        for event in SupportedEvent::ALL {
            assert_eq!(event.as_str().parse::<SupportedEvent>(), Ok(event));
        }
        assert_eq!(
            "dirty".parse::<SupportedEvent>(),
            Err(UnsupportedEvent("dirty".to_string()))
        );
    }

    #[test]
    fn hello_payload_keeps_unknown_fields() {
        let payload = decode_payload(
            SupportedEvent::Hello,
            r#"{"machine_id":"abc","active_clients":2}"#,
        )
        .expect("decode hello");
        let EventPayload::Hello(welcome) = payload else {
            panic!("expected hello payload");
        };
        assert_eq!(welcome.machine_id.as_deref(), Some("abc"));
        assert_eq!(welcome.extra.get("active_clients"), Some(&json!(2)));
    }

    #[test]
    fn synthetic_liveness_payload_decodes_as_not_alive() {
        let payload = decode_payload(SupportedEvent::Heartbeat, HealthPing::NOT_ALIVE_JSON)
            .expect("decode heartbeat");
        assert_eq!(
            payload,
            EventPayload::Heartbeat(HealthPing {
                alive: false,
                read_only: true,
                ..HealthPing::default()
            })
        );
    }

    #[test]
    fn volumes_payload_must_be_an_array() {
        let err = decode_payload(SupportedEvent::Volumes, r#"{"disk":"sda"}"#)
            .expect_err("object is not a volume list");
        assert_eq!(err.event, SupportedEvent::Volumes);
    }

    #[test]
    fn malformed_json_is_reported_with_its_event() {
        let err = decode_payload(SupportedEvent::Shares, "[{").expect_err("truncated json");
        assert!(err.to_string().starts_with("invalid `shares` payload"));
    }

    #[test]
    fn socket_frame_strips_tags() {
        let frame = SocketFrame::parse("id: 17\nevent: heartbeat\ndata: {\"alive\":true}\n\n")
            .expect("parse frame");
        assert_eq!(frame.id, "17");
        assert_eq!(frame.event, "heartbeat");
        assert_eq!(frame.data, "{\"alive\":true}");
    }

    #[test]
    fn socket_frame_text_parses_back() {
        let frame = SocketFrame {
            id: "3".to_string(),
            event: "shares".to_string(),
            data: "[]".to_string(),
        };
        assert_eq!(SocketFrame::parse(&frame.to_text()), Ok(frame));
    }

    #[test]
    fn socket_frame_rejects_missing_segments_and_tags() {
        assert_eq!(
            SocketFrame::parse("id: 1\nevent: hello"),
            Err(FrameError::MissingSegments(2))
        );
        assert_eq!(
            SocketFrame::parse("id: 1\ntype: hello\ndata: {}"),
            Err(FrameError::MissingTag("event:"))
        );
    }
}
