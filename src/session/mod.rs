//! # Conversation Session Management
//!
//! One `Session` per live conversation between a patient and the AI
//! companion. The registry is the sole owner of session state; every other
//! component (gateway, pipeline, upstream manager) holds only the session id
//! and goes through the registry's synchronized accessors.
//!
//! ## Session Lifecycle:
//! 1. **Idle**: connected, waiting for input
//! 2. **Listening**: capturing a voice recording
//! 3. **Processing**: a pipeline run is normalizing and generating
//! 4. **Speaking**: synthesis and delivery in progress
//! 5. **Closed**: ended, timed out, or disconnected (terminal)

mod registry;
mod sweeper;

pub use registry::SessionRegistry;
pub use sweeper::InactivitySweeper;

use crate::protocol::ServerFrame;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tokio::sync::mpsc::UnboundedSender;

/// Current status of a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Idle,
    Listening,
    Processing,
    Speaking,
    Closed,
}

impl SessionStatus {
    /// Status string used in `agent_status` frames and API responses.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Listening => "listening",
            SessionStatus::Processing => "processing",
            SessionStatus::Speaking => "speaking",
            SessionStatus::Closed => "closed",
        }
    }

    /// Whether `next` is a legal edge from this status.
    ///
    /// `Processing -> Idle` and `Speaking -> Idle` cover both normal turn
    /// completion and per-turn failure recovery; a failed turn returns the
    /// session to `Idle` rather than closing it. `Closed` is terminal.
    pub fn can_transition(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (Idle, Listening) | (Idle, Processing) => true,
            (Listening, Processing) => true,
            (Processing, Speaking) | (Processing, Idle) => true,
            (Speaking, Idle) => true,
            _ => false,
        }
    }
}

/// One completed exchange, kept as generation context for later turns.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    pub user: String,
    pub assistant: String,
}

/// Registry-internal session record. Never handed out; callers receive
/// [`SessionSnapshot`] copies.
pub(crate) struct Session {
    pub(crate) session_id: String,
    pub(crate) user_id: String,
    pub(crate) channel: String,
    pub(crate) status: SessionStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) last_activity: DateTime<Utc>,
    /// Correlation id of the in-flight pipeline run, if any.
    pub(crate) pending_message: Option<String>,
    /// Voice capture buffer, filled by `audio_chunk` frames while Listening.
    pub(crate) capture: Vec<u8>,
    /// Most recent turns, oldest first, bounded by the registry's depth.
    pub(crate) history: VecDeque<Turn>,
    /// Outbound channel to the client connection currently bound to this
    /// session. Dropping it terminates the connection.
    pub(crate) client: Option<UnboundedSender<ServerFrame>>,
}

impl Session {
    pub(crate) fn new(session_id: String, user_id: String, channel: String) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id,
            channel,
            status: SessionStatus::Idle,
            created_at: now,
            last_activity: now,
            pending_message: None,
            capture: Vec::new(),
            history: VecDeque::new(),
            client: None,
        }
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            user_id: self.user_id.clone(),
            channel: self.channel.clone(),
            status: self.status,
            created_at: self.created_at,
            last_activity: self.last_activity,
            pending_message: self.pending_message.clone(),
        }
    }
}

/// Read-only copy of a session's state at one instant.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub user_id: String,
    pub channel: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub pending_message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_edges_match_the_state_machine() {
        use SessionStatus::*;

        let allowed = [
            (Idle, Listening),
            (Idle, Processing),
            (Listening, Processing),
            (Processing, Speaking),
            (Processing, Idle),
            (Speaking, Idle),
            (Idle, Closed),
            (Listening, Closed),
            (Processing, Closed),
            (Speaking, Closed),
        ];
        for (from, to) in allowed {
            assert!(from.can_transition(to), "{:?} -> {:?} should be legal", from, to);
        }

        let forbidden = [
            (Idle, Speaking),
            (Listening, Speaking),
            (Listening, Idle),
            (Speaking, Processing),
            (Speaking, Listening),
            (Processing, Listening),
            (Closed, Idle),
            (Closed, Processing),
        ];
        for (from, to) in forbidden {
            assert!(!from.can_transition(to), "{:?} -> {:?} should be illegal", from, to);
        }
    }

    #[test]
    fn new_session_starts_idle_with_empty_history() {
        let session = Session::new("s1".to_string(), "u1".to_string(), "c1".to_string());
        assert_eq!(session.status, SessionStatus::Idle);
        assert!(session.history.is_empty());
        assert!(session.pending_message.is_none());
        assert!(session.client.is_none());
    }
}
