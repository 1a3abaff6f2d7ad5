//! Rust client for the SRAT server-event stream.
//!
//! The crate is organized by concern:
//! - `stream`: transports, reconnect handling, the typed event document, and
//!   the reference-counted subscription cache.
//! - `retry`: shared retry and timeout utilities.

/// Retry and timeout helpers used by the transports.
pub mod retry;
/// Realtime event stream client, protocol types, and subscription cache.
pub mod stream;

pub use stream::cache::{QueryResult, ServerEventsCache, Subscription};
pub use stream::client::{
    ConnectionHealth, EventSource, EventStreamClient, EventStreamError, EventStreamOptions,
    TransportKind,
};
pub use stream::multiplexer::EventDocument;
pub use stream::proto::SupportedEvent;
