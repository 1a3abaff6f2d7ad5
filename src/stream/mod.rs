//! Realtime event stream modules.
//!
//! - `transport`: adapter seam plus the `sse` and `ws` connectors.
//! - `fault` and `reconnect`: error counting, inactivity and reconnect timing.
//! - `client`: event source and the connection worker that drives it.
//! - `multiplexer` and `cache`: typed document and subscriber lifecycle.

/// Reference-counted subscription cache.
pub mod cache;
/// Event source, options, and connection worker.
pub mod client;
/// Fault counting and the inactivity window.
pub mod fault;
/// Folds named events into the typed event document.
pub mod multiplexer;
/// Event names, payload types, and socket framing.
pub mod proto;
/// Reconnect state machine and its single pending deadline.
pub mod reconnect;
/// Ordered listener registry and the messages handed to listeners.
pub mod registry;
/// Server-sent events transport.
pub mod sse;
/// Transport adapter seam shared by the SSE and websocket connectors.
pub mod transport;
/// Websocket transport.
pub mod ws;
