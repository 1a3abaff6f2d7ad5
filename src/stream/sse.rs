//! Server-sent events transport.
//!
//! Behaves like a browser `EventSource`: a broken stream is reported as an
//! error and redialed after the retry interval, while a response that is not
//! an event stream at all closes the transport for good.

use std::time::Duration;

use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CACHE_CONTROL, CONTENT_TYPE};
use reqwest::{Client, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::retry::{retry_async, with_timeout, RetryPolicy};
use crate::stream::client::{EventStreamError, EventStreamOptions};
use crate::stream::transport::{Connector, SignalSink, TaskTransport, Transport, TransportSignal};

const EVENT_STREAM_MIME: &str = "text/event-stream";
const LAST_EVENT_ID_HEADER: &str = "Last-Event-ID";
const DEFAULT_EVENT_NAME: &str = "message";

/// One dispatched event-stream message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseMessage {
    pub name: String,
    pub data: String,
    pub id: Option<String>,
}

/// Upper bound on a single unterminated line kept in memory.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// The server sent more than the line limit without a newline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("event stream line exceeds {limit} bytes")]
pub struct LineTooLong {
    pub limit: usize,
}

/// Incremental parser for the `text/event-stream` format.
///
/// Lines may end in `\n` or `\r\n`. Chunks can split lines, and multi-byte
/// characters, at any byte.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    line_limit: usize,
    event: Option<String>,
    data: String,
    has_data: bool,
    last_event_id: Option<String>,
    retry: Option<Duration>,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_line_limit(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_line_limit(line_limit: usize) -> Self {
        Self {
            buffer: Vec::new(),
            line_limit,
            event: None,
            data: String::new(),
            has_data: false,
            last_event_id: None,
            retry: None,
        }
    }

    /// Feeds a chunk of the response body and appends every message it
    /// completed to `messages`.
    ///
    /// Fails when the unterminated tail grows past the line limit. The tail is
    /// dropped and the stream should be treated as broken; messages completed
    /// before it are still appended.
    pub fn feed(
        &mut self,
        chunk: &[u8],
        messages: &mut Vec<SseMessage>,
    ) -> Result<(), LineTooLong> {
        self.buffer.extend_from_slice(chunk);
        while let Some(newline) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if let Some(message) = self.process_line(&String::from_utf8_lossy(&line)) {
                messages.push(message);
            }
        }

        if self.buffer.len() > self.line_limit {
            self.buffer.clear();
            return Err(LineTooLong {
                limit: self.line_limit,
            });
        }
        Ok(())
    }

    /// Forgets everything tied to the previous response. Only the last event
    /// id survives, so it can be sent back on the next request.
    pub fn reset_stream(&mut self) {
        self.buffer.clear();
        self.event = None;
        self.data.clear();
        self.has_data = false;
    }

    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Returns the most recent `retry:` interval, if the server sent one
    /// since the last call.
    pub fn take_retry(&mut self) -> Option<Duration> {
        self.retry.take()
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "id" if !value.contains('\0') => self.last_event_id = Some(value.to_string()),
            "retry" => {
                if let Ok(millis) = value.parse::<u64>() {
                    self.retry = Some(Duration::from_millis(millis));
                }
            }
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseMessage> {
        let name = self.event.take();
        if !self.has_data {
            return None;
        }
        self.has_data = false;
        Some(SseMessage {
            name: name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| DEFAULT_EVENT_NAME.to_string()),
            data: std::mem::take(&mut self.data),
            id: self.last_event_id.clone(),
        })
    }
}

/// Opens `GET <endpoint>` event streams with a shared HTTP client.
#[derive(Clone, Debug)]
pub struct SseConnector {
    http: Client,
    retry: RetryPolicy,
    connect_timeout: Duration,
}

impl SseConnector {
    pub fn new(options: &EventStreamOptions) -> Result<Self, EventStreamError> {
        let http = Client::builder()
            .cookie_store(options.with_credentials)
            .connect_timeout(options.connect_timeout)
            .build()?;
        Ok(Self {
            http,
            retry: options.sse_retry.clone(),
            connect_timeout: options.connect_timeout,
        })
    }
}

impl Connector for SseConnector {
    fn connect(&self, endpoint: &str, sink: SignalSink) -> Box<dyn Transport> {
        let task = tokio::spawn(run_event_stream(
            self.http.clone(),
            endpoint.to_string(),
            self.retry.clone(),
            self.connect_timeout,
            sink,
        ));
        Box::new(TaskTransport::new(task))
    }
}

#[derive(Debug, Error)]
enum DialError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("unexpected content type `{0}`")]
    ContentType(String),
}

impl DialError {
    fn is_transient(&self) -> bool {
        match self {
            DialError::Request(_) | DialError::Timeout(_) => true,
            DialError::Status(status) => status.is_server_error(),
            DialError::ContentType(_) => false,
        }
    }
}

async fn run_event_stream(
    http: Client,
    endpoint: String,
    mut policy: RetryPolicy,
    connect_timeout: Duration,
    sink: SignalSink,
) {
    let mut decoder = SseDecoder::new();

    loop {
        let last_event_id = decoder.last_event_id().map(str::to_string);
        let dialed = retry_async(
            &policy,
            |attempt| dial(&http, &endpoint, last_event_id.as_deref(), connect_timeout, &sink, attempt),
            DialError::is_transient,
        )
        .await;

        let response = match dialed {
            Ok(response) => response,
            Err(err) => {
                sink.send(TransportSignal::Closed(err.to_string()));
                return;
            }
        };
        decoder.reset_stream();
        if !sink.send(TransportSignal::Open) {
            return;
        }

        let mut body = response.bytes_stream();
        let mut messages = Vec::new();
        let reason = loop {
            match body.next().await {
                Some(Ok(chunk)) => {
                    let decoded = decoder.feed(&chunk, &mut messages);
                    for message in messages.drain(..) {
                        let delivered = sink.send(TransportSignal::Event {
                            name: message.name,
                            data: message.data,
                            id: message.id,
                        });
                        if !delivered {
                            return;
                        }
                    }
                    if let Err(err) = decoded {
                        break err.to_string();
                    }
                }
                Some(Err(err)) => break err.to_string(),
                None => break "event stream ended".to_string(),
            }
        };

        if let Some(interval) = decoder.take_retry() {
            debug!(
                event = "sse_retry_updated",
                generation = sink.generation(),
                retry_ms = interval.as_millis() as u64
            );
            policy = policy.with_interval(interval);
        }
        if !sink.send(TransportSignal::Error(reason)) {
            return;
        }
        tokio::time::sleep(policy.delay_for_attempt(1)).await;
        if sink.is_closed() {
            debug!(event = "sse_redial_skipped", generation = sink.generation());
            return;
        }
    }
}

async fn dial(
    http: &Client,
    endpoint: &str,
    last_event_id: Option<&str>,
    connect_timeout: Duration,
    sink: &SignalSink,
    attempt: usize,
) -> Result<reqwest::Response, DialError> {
    let mut request = http
        .get(endpoint)
        .header(ACCEPT, EVENT_STREAM_MIME)
        .header(CACHE_CONTROL, "no-cache");
    if let Some(id) = last_event_id {
        request = request.header(LAST_EVENT_ID_HEADER, id);
    }

    let result = match with_timeout(connect_timeout, request.send()).await {
        Ok(Ok(response)) => check_response(response),
        Ok(Err(err)) => Err(DialError::Request(err)),
        Err(_) => Err(DialError::Timeout(connect_timeout)),
    };

    if let Err(err) = &result {
        warn!(
            event = "sse_dial_failed",
            generation = sink.generation(),
            attempt,
            error = %err
        );
        if err.is_transient() {
            sink.send(TransportSignal::Error(err.to_string()));
        }
    }
    result
}

fn check_response(response: reqwest::Response) -> Result<reqwest::Response, DialError> {
    let status = response.status();
    if !status.is_success() {
        return Err(DialError::Status(status));
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    if !content_type.starts_with(EVENT_STREAM_MIME) {
        return Err(DialError::ContentType(content_type.to_string()));
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(decoder: &mut SseDecoder, chunk: &[u8]) -> Vec<SseMessage> {
        let mut messages = Vec::new();
        decoder.feed(chunk, &mut messages).expect("line within limit");
        messages
    }

    #[test]
    fn dispatches_named_event_on_blank_line() {
        let mut decoder = SseDecoder::new();
        assert!(feed(&mut decoder, b"event: heartbeat\ndata: {\"alive\":true}\n").is_empty());
        assert_eq!(
            feed(&mut decoder, b"\n"),
            vec![SseMessage {
                name: "heartbeat".to_string(),
                data: "{\"alive\":true}".to_string(),
                id: None,
            }]
        );
    }

    #[test]
    fn joins_data_lines_and_keeps_last_event_id() {
        let mut decoder = SseDecoder::new();
        let messages = feed(&mut decoder, b"id: 9\r\nevent: shares\r\ndata: [\r\ndata: ]\r\n\r\n");
        assert_eq!(
            messages,
            vec![SseMessage {
                name: "shares".to_string(),
                data: "[\n]".to_string(),
                id: Some("9".to_string()),
            }]
        );
        assert_eq!(decoder.last_event_id(), Some("9"));
    }

    #[test]
    fn handles_lines_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(feed(&mut decoder, b"event: hel").is_empty());
        assert!(feed(&mut decoder, b"lo\ndata: {\"machine_id\":").is_empty());
        let messages = feed(&mut decoder, b"\"abc\"}\n\n");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].name, "hello");
        assert_eq!(messages[0].data, "{\"machine_id\":\"abc\"}");
    }

    #[test]
    fn ignores_comments_and_events_without_data() {
        let mut decoder = SseDecoder::new();
        assert!(feed(&mut decoder, b": keep-alive\n\nevent: volumes\n\n").is_empty());
        let messages = feed(&mut decoder, b"data: []\n\n");
        assert_eq!(messages[0].name, DEFAULT_EVENT_NAME);
    }

    #[test]
    fn records_numeric_retry_only() {
        let mut decoder = SseDecoder::new();
        feed(&mut decoder, b"retry: soon\n");
        assert_eq!(decoder.take_retry(), None);
        feed(&mut decoder, b"retry: 1500\n");
        assert_eq!(decoder.take_retry(), Some(Duration::from_millis(1500)));
        assert_eq!(decoder.take_retry(), None);
    }

    #[test]
    fn reset_drops_half_read_event_but_keeps_last_id() {
        let mut decoder = SseDecoder::new();
        assert!(feed(&mut decoder, b"id: 4\nevent: heartbeat\ndata: {\"al").is_empty());

        decoder.reset_stream();
        let messages = feed(&mut decoder, b"event: hello\ndata: {\"machine_id\":\"abc\"}\n\n");
        assert_eq!(
            messages,
            vec![SseMessage {
                name: "hello".to_string(),
                data: "{\"machine_id\":\"abc\"}".to_string(),
                id: Some("4".to_string()),
            }]
        );
        assert_eq!(decoder.last_event_id(), Some("4"));
    }

    #[test]
    fn unterminated_line_over_limit_is_rejected() {
        let mut decoder = SseDecoder::with_line_limit(16);
        let mut messages = Vec::new();
        let result = decoder.feed(b"data: []\n\ndata: 0123456789abcdef", &mut messages);

        assert_eq!(result, Err(LineTooLong { limit: 16 }));
        assert_eq!(messages.len(), 1, "completed messages are kept");
        assert!(feed(&mut decoder, b"\n\n").is_empty());
    }

    #[test]
    fn client_errors_are_permanent() {
        assert!(!DialError::Status(StatusCode::UNAUTHORIZED).is_transient());
        assert!(DialError::Status(StatusCode::BAD_GATEWAY).is_transient());
        assert!(!DialError::ContentType("text/html".to_string()).is_transient());
    }
}
