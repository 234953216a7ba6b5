//! # Session Registry
//!
//! Authoritative in-memory map from session id to session state. All status
//! mutation goes through [`SessionRegistry::transition`], a compare-and-set
//! that rejects stale writers instead of overwriting, which is what keeps a
//! session single-writer while many pipeline runs execute concurrently for
//! different sessions.
//!
//! ## Thread Safety:
//! One RwLock guards the whole map. Every operation is a short, non-blocking
//! critical section (sends on the outbound channel never block), so the
//! registry can be called from any task without holding locks across awaits.

use crate::error::SessionError;
use crate::events::{CloseReason, EventBus, SessionEvent};
use crate::protocol::ServerFrame;
use crate::session::{Session, SessionSnapshot, SessionStatus, Turn};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;
use uuid::Uuid;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
    max_sessions: usize,
    history_depth: usize,
    events: EventBus,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, history_depth: usize, events: EventBus) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
            history_depth,
            events,
        }
    }

    /// Creates a session in `Idle`. A caller-supplied id is honored so the
    /// gateway can hand the id to the client before any message flows;
    /// otherwise one is generated.
    pub fn create(
        &self,
        session_id: Option<String>,
        user_id: &str,
        channel: &str,
    ) -> Result<String, SessionError> {
        let mut sessions = self.sessions.write().unwrap();

        if sessions.len() >= self.max_sessions {
            return Err(SessionError::LimitReached(self.max_sessions));
        }

        let session_id =
            session_id.unwrap_or_else(|| format!("client_{}", Uuid::new_v4().simple()));

        if sessions.contains_key(&session_id) {
            return Err(SessionError::Duplicate(session_id));
        }

        let session = Session::new(session_id.clone(), user_id.to_string(), channel.to_string());
        sessions.insert(session_id.clone(), session);

        debug!(session_id = %session_id, "session created");
        Ok(session_id)
    }

    pub fn get(&self, session_id: &str) -> Result<SessionSnapshot, SessionError> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .get(session_id)
            .map(Session::snapshot)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Binds patient identity and channel, typically from an `initialize`
    /// frame arriving after the connection-time create.
    pub fn bind_identity(
        &self,
        session_id: &str,
        user_id: &str,
        channel: &str,
    ) -> Result<SessionSnapshot, SessionError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.user_id = user_id.to_string();
        session.channel = channel.to_string();
        session.last_activity = Utc::now();
        Ok(session.snapshot())
    }

    /// Attaches the outbound channel of the client connection serving this
    /// session. Responses for the session go to this channel and nowhere else.
    pub fn attach_client(
        &self,
        session_id: &str,
        client: UnboundedSender<ServerFrame>,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        session.client = Some(client);
        Ok(())
    }

    /// Compare-and-set status change. Fails with `Conflict` when the current
    /// status differs from `expected` and leaves the session untouched, so a
    /// pipeline run racing a close (or a second run) can never clobber state.
    ///
    /// Every successful transition pushes an `agent_status` frame to the
    /// session's client and publishes a `StatusChanged` event.
    pub fn transition(
        &self,
        session_id: &str,
        expected: SessionStatus,
        next: SessionStatus,
    ) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if session.status != expected {
            return Err(SessionError::Conflict {
                session_id: session_id.to_string(),
                expected,
                actual: session.status,
            });
        }
        if !expected.can_transition(next) {
            return Err(SessionError::InvalidTransition { from: expected, to: next });
        }

        session.status = next;
        session.last_activity = Utc::now();

        if next != SessionStatus::Closed {
            if let Some(client) = &session.client {
                let _ = client.send(ServerFrame::AgentStatus {
                    status: next.as_str().to_string(),
                });
            }
        }
        self.events.publish(SessionEvent::StatusChanged {
            session_id: session_id.to_string(),
            status: next,
        });

        Ok(())
    }

    /// Refreshes `last_activity`; called on every inbound or outbound
    /// message so the sweeper only evicts genuinely idle conversations.
    pub fn touch(&self, session_id: &str) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_activity = Utc::now();
        }
    }

    /// Records or clears the correlation id of the in-flight pipeline run.
    pub fn set_pending_message(&self, session_id: &str, message_id: Option<String>) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(session_id) {
            session.pending_message = message_id;
        }
    }

    /// Appends captured audio. Only legal while the session is `Listening`.
    pub fn buffer_audio(&self, session_id: &str, data: &[u8]) -> Result<usize, SessionError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        if session.status != SessionStatus::Listening {
            return Err(SessionError::Conflict {
                session_id: session_id.to_string(),
                expected: SessionStatus::Listening,
                actual: session.status,
            });
        }

        session.capture.extend_from_slice(data);
        session.last_activity = Utc::now();
        Ok(session.capture.len())
    }

    /// Drains the capture buffer for a pipeline run.
    pub fn take_audio(&self, session_id: &str) -> Result<Vec<u8>, SessionError> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
        Ok(std::mem::take(&mut session.capture))
    }

    /// Records a completed exchange, truncating to the configured depth.
    pub fn record_turn(&self, session_id: &str, user: String, assistant: String) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(session_id) {
            session.history.push_back(Turn { user, assistant });
            while session.history.len() > self.history_depth {
                session.history.pop_front();
            }
        }
    }

    /// Recent turns, oldest first, for generation context.
    pub fn history(&self, session_id: &str) -> Result<Vec<Turn>, SessionError> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .get(session_id)
            .map(|s| s.history.iter().cloned().collect())
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    /// Delivers a frame to the connection bound to this session. Returns
    /// false when the session is gone or has no live client.
    pub fn emit(&self, session_id: &str, frame: ServerFrame) -> bool {
        let sessions = self.sessions.read().unwrap();
        match sessions.get(session_id).and_then(|s| s.client.as_ref()) {
            Some(client) => client.send(frame).is_ok(),
            None => false,
        }
    }

    /// Closes and evicts a session. Dropping the outbound channel makes the
    /// client connection's relay wind down, which closes the socket.
    pub fn remove(&self, session_id: &str, reason: CloseReason) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().unwrap();
            sessions.remove(session_id)
        };

        match removed {
            Some(_) => {
                self.events.publish(SessionEvent::StatusChanged {
                    session_id: session_id.to_string(),
                    status: SessionStatus::Closed,
                });
                self.events.publish(SessionEvent::SessionClosed {
                    session_id: session_id.to_string(),
                    reason,
                });
                debug!(session_id = %session_id, reason = reason.as_str(), "session removed");
                true
            }
            None => false,
        }
    }

    /// Sessions whose `last_activity` is older than `threshold`.
    pub fn list_idle_since(&self, threshold: Duration) -> Vec<String> {
        let now = Utc::now();
        let sessions = self.sessions.read().unwrap();
        sessions
            .values()
            .filter(|s| now.signed_duration_since(s.last_activity) > threshold)
            .map(|s| s.session_id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    pub fn capacity(&self) -> usize {
        self.max_sessions
    }

    pub fn snapshot_all(&self) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.read().unwrap();
        sessions.values().map(Session::snapshot).collect()
    }

    /// Session count per status, for the metrics endpoint.
    pub fn status_counts(&self) -> HashMap<&'static str, usize> {
        let sessions = self.sessions.read().unwrap();
        let mut counts = HashMap::new();
        for session in sessions.values() {
            *counts.entry(session.status.as_str()).or_insert(0) += 1;
        }
        counts
    }

    /// Test hook: rewinds a session's activity clock.
    #[cfg(test)]
    pub(crate) fn force_last_activity(&self, session_id: &str, ago: Duration) {
        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(session_id) {
            session.last_activity = Utc::now() - ago;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(4, 5, EventBus::new(16))
    }

    #[test]
    fn create_rejects_duplicates_and_enforces_capacity() {
        let registry = SessionRegistry::new(2, 5, EventBus::new(16));

        let id = registry.create(Some("s1".to_string()), "u1", "c1").unwrap();
        assert_eq!(id, "s1");
        assert_eq!(
            registry.create(Some("s1".to_string()), "u1", "c1"),
            Err(SessionError::Duplicate("s1".to_string()))
        );

        registry.create(None, "u2", "c2").unwrap();
        assert_eq!(registry.create(None, "u3", "c3"), Err(SessionError::LimitReached(2)));
    }

    #[test]
    fn transition_is_compare_and_set() {
        let registry = registry();
        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();

        registry
            .transition("s1", SessionStatus::Idle, SessionStatus::Processing)
            .unwrap();

        // Stale writer: expects Idle, finds Processing. No overwrite.
        let err = registry
            .transition("s1", SessionStatus::Idle, SessionStatus::Listening)
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Conflict { actual: SessionStatus::Processing, .. }
        ));
        assert_eq!(registry.get("s1").unwrap().status, SessionStatus::Processing);
    }

    #[test]
    fn transition_rejects_edges_outside_the_state_machine() {
        let registry = registry();
        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();

        let err = registry
            .transition("s1", SessionStatus::Idle, SessionStatus::Speaking)
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidTransition { .. }));
        assert_eq!(registry.get("s1").unwrap().status, SessionStatus::Idle);
    }

    #[test]
    fn transitions_publish_status_events_and_client_frames() {
        let bus = EventBus::new(16);
        let registry = SessionRegistry::new(4, 5, bus.clone());
        let mut events = bus.subscribe();

        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.attach_client("s1", tx).unwrap();

        registry
            .transition("s1", SessionStatus::Idle, SessionStatus::Listening)
            .unwrap();

        match rx.try_recv().unwrap() {
            ServerFrame::AgentStatus { status } => assert_eq!(status, "listening"),
            other => panic!("unexpected frame: {:?}", other),
        }
        match events.try_recv().unwrap() {
            SessionEvent::StatusChanged { status, .. } => {
                assert_eq!(status, SessionStatus::Listening)
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emit_reaches_only_the_owning_connection() {
        let registry = registry();
        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();
        registry.create(Some("s2".to_string()), "u2", "c2").unwrap();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.attach_client("s1", tx1).unwrap();
        registry.attach_client("s2", tx2).unwrap();

        assert!(registry.emit("s1", ServerFrame::Pong));

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn audio_buffering_requires_listening() {
        let registry = registry();
        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();

        let err = registry.buffer_audio("s1", &[1, 2, 3]).unwrap_err();
        assert!(matches!(err, SessionError::Conflict { .. }));

        registry
            .transition("s1", SessionStatus::Idle, SessionStatus::Listening)
            .unwrap();
        assert_eq!(registry.buffer_audio("s1", &[1, 2, 3]).unwrap(), 3);
        assert_eq!(registry.buffer_audio("s1", &[4]).unwrap(), 4);

        assert_eq!(registry.take_audio("s1").unwrap(), vec![1, 2, 3, 4]);
        assert!(registry.take_audio("s1").unwrap().is_empty());
    }

    #[test]
    fn history_is_bounded_to_the_configured_depth() {
        let registry = SessionRegistry::new(4, 2, EventBus::new(16));
        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();

        for i in 0..4 {
            registry.record_turn("s1", format!("q{}", i), format!("a{}", i));
        }

        let history = registry.history("s1").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].user, "q2");
        assert_eq!(history[1].user, "q3");
    }

    #[test]
    fn remove_drops_the_client_channel() {
        let registry = registry();
        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
        registry.attach_client("s1", tx).unwrap();

        assert!(registry.remove("s1", CloseReason::Request));
        assert!(!registry.remove("s1", CloseReason::Request));

        // Sender gone: the relay sees a closed channel.
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        assert!(matches!(registry.get("s1"), Err(SessionError::NotFound(_))));
    }

    #[test]
    fn list_idle_since_selects_only_stale_sessions() {
        let registry = registry();
        registry.create(Some("old".to_string()), "u1", "c1").unwrap();
        registry.create(Some("fresh".to_string()), "u2", "c2").unwrap();
        registry.force_last_activity("old", Duration::seconds(600));

        let idle = registry.list_idle_since(Duration::seconds(300));
        assert_eq!(idle, vec!["old".to_string()]);
    }
}
