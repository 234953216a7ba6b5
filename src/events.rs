//! # Session Event Bus
//!
//! Broadcast channel carrying orchestrator events to any number of
//! independent consumers (logging, metrics, UI bridges). Publishers never
//! know who is listening; a consumer that falls behind loses old events
//! rather than blocking the orchestrator.

use crate::session::SessionStatus;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Why a session was taken out of the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit end of conversation (client request or operator action).
    Request,
    /// The client connection dropped.
    Disconnect,
    /// Idle past the inactivity threshold; evicted by the sweeper.
    Inactivity,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::Request => "request",
            CloseReason::Disconnect => "disconnect",
            CloseReason::Inactivity => "inactivity",
        }
    }
}

/// Everything observable about a conversation from the outside.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session moved to a new status.
    StatusChanged {
        session_id: String,
        status: SessionStatus,
    },

    /// One pipeline run completed and its response was emitted.
    /// `degraded` marks a fallback reply (a provider stage failed).
    ResponseEmitted {
        session_id: String,
        message_id: String,
        degraded: bool,
    },

    /// A session was closed and evicted.
    SessionClosed {
        session_id: String,
        reason: CloseReason,
    },

    /// A status report relayed from the upstream transport.
    UpstreamStatus { session_id: String, status: String },
}

/// Cloneable handle to the broadcast channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes to all current subscribers. A bus with no subscribers is
    /// not an error; the event is simply dropped.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

/// Long-lived consumer that mirrors every event into the log stream.
pub fn spawn_event_logger(bus: &EventBus) -> tokio::task::JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::StatusChanged { session_id, status }) => {
                    debug!(session_id = %session_id, status = status.as_str(), "session status changed");
                }
                Ok(SessionEvent::ResponseEmitted { session_id, message_id, degraded }) => {
                    debug!(session_id = %session_id, message_id = %message_id, degraded, "response emitted");
                }
                Ok(SessionEvent::SessionClosed { session_id, reason }) => {
                    info!(session_id = %session_id, reason = reason.as_str(), "session closed");
                }
                Ok(SessionEvent::UpstreamStatus { session_id, status }) => {
                    debug!(session_id = %session_id, status = %status, "upstream status update");
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "event logger lagged behind the bus");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
