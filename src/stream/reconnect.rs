//! Reconnect timing for a single logical stream.
//!
//! The controller owns the fault counter and the pending reconnect deadline.
//! It never touches transports itself; the connection worker asks it what to
//! do and performs the adapter swap when [`ReconnectController::fire`] says so.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::stream::fault::FaultDetector;

/// Lifecycle of the live adapter as seen by the reconnect logic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// A new adapter is being constructed. Also the initial state.
    Reconnecting,
    Connected,
    /// At least one fault since the last open, below the threshold.
    Faulting,
    /// Reconnect deadline armed.
    ReconnectPending,
}

/// Why a reconnect was requested.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconnectReason {
    FaultThreshold,
    TransportClosed,
    Inactivity,
}

impl fmt::Display for ReconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ReconnectReason::FaultThreshold => "fault_threshold",
            ReconnectReason::TransportClosed => "transport_closed",
            ReconnectReason::Inactivity => "inactivity",
        })
    }
}

/// Result of feeding one error signal to the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Below the threshold; nothing armed.
    Transient { faults: u32 },
    /// This fault armed the reconnect deadline.
    ReconnectArmed { faults: u32, at: Instant },
    /// Threshold exceeded but a deadline is already pending.
    AlreadyPending { faults: u32 },
}

#[derive(Debug)]
pub struct ReconnectController {
    detector: FaultDetector,
    delay: Duration,
    pending: Option<Instant>,
    state: ConnectionState,
}

impl ReconnectController {
    pub fn new(fault_threshold: u32, delay: Duration) -> Self {
        Self {
            detector: FaultDetector::new(fault_threshold),
            delay,
            pending: None,
            state: ConnectionState::Reconnecting,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn faults(&self) -> u32 {
        self.detector.faults()
    }

    pub fn pending_deadline(&self) -> Option<Instant> {
        self.pending
    }

    /// Handles a successful open. Returns true when a pending reconnect was
    /// cancelled by it.
    pub fn on_open(&mut self) -> bool {
        self.detector.reset();
        self.state = ConnectionState::Connected;
        self.pending.take().is_some()
    }

    pub fn on_error(&mut self, now: Instant) -> FaultOutcome {
        let faults = self.detector.record_fault();
        if !self.detector.is_breached() {
            if self.pending.is_none() {
                self.state = ConnectionState::Faulting;
            }
            return FaultOutcome::Transient { faults };
        }
        match self.schedule(now) {
            Some(at) => FaultOutcome::ReconnectArmed { faults, at },
            None => FaultOutcome::AlreadyPending { faults },
        }
    }

    /// Arms the reconnect deadline unless one is already pending. Used
    /// directly for closed transports and inactivity, which bypass the fault
    /// threshold.
    pub fn schedule(&mut self, now: Instant) -> Option<Instant> {
        if self.pending.is_some() {
            return None;
        }
        let at = now + self.delay;
        self.pending = Some(at);
        self.state = ConnectionState::ReconnectPending;
        Some(at)
    }

    /// Consumes the pending deadline if it has elapsed. Returns true when the
    /// caller must replace the adapter now.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.pending {
            Some(at) if at <= now => {
                self.pending = None;
                self.state = ConnectionState::Reconnecting;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.pending = None;
    }
}
