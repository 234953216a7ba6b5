//! # Upstream Transport Connection Manager
//!
//! Owns the single outbound WebSocket link to the upstream real-time AI
//! transport. All sessions multiplex over this one connection; none may hold
//! it exclusively.
//!
//! ## Connection lifecycle:
//! `disconnected -> connecting -> connected`, then back through
//! `reconnecting` on any unexpected close, bounded by
//! `max_reconnect_attempts` with exponential backoff. Exhausting the budget
//! parks the link in a terminal `failed` state until an explicit `connect`.
//!
//! ## Heartbeat:
//! A protocol-level `ping` goes out on a fixed interval and the peer's
//! `pong` is tracked. A silent peer past the heartbeat timeout is treated as
//! a dead link and torn down, so a half-open connection cannot linger.

use crate::config::UpstreamConfig;
use crate::error::UpstreamError;
use crate::events::{EventBus, SessionEvent};
use crate::protocol::{UpstreamFrame, UpstreamInit, UpstreamResponse};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Reconnect delays top out here regardless of attempt count.
const MAX_BACKOFF_MS: u64 = 30_000;

/// State of the logical upstream link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Retry budget exhausted; only an explicit `connect` leaves this state.
    Failed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Failed => "failed",
        }
    }
}

/// Exponential backoff: `base * 2^(attempt-1)`, capped.
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base_ms.saturating_mul(1u64 << exponent).min(MAX_BACKOFF_MS);
    Duration::from_millis(delay)
}

pub struct UpstreamManager {
    config: UpstreamConfig,
    state: Mutex<LinkState>,
    /// Writer half of the live connection, fed by `send`. Absent while down.
    writer: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    /// Incremented per successful open; lets stale reader/heartbeat tasks
    /// from a previous connection recognize they are obsolete.
    generation: AtomicU64,
    reconnect_attempts: AtomicU32,
    total_reconnects: AtomicU64,
    shutting_down: AtomicBool,
    last_pong: Mutex<Instant>,
    /// Per-session consumers of upstream `response` frames.
    listeners: RwLock<HashMap<String, mpsc::UnboundedSender<UpstreamResponse>>>,
    events: EventBus,
}

impl UpstreamManager {
    pub fn new(config: UpstreamConfig, events: EventBus) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: Mutex::new(LinkState::Disconnected),
            writer: Mutex::new(None),
            generation: AtomicU64::new(0),
            reconnect_attempts: AtomicU32::new(0),
            total_reconnects: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            last_pong: Mutex::new(Instant::now()),
            listeners: RwLock::new(HashMap::new()),
            events,
        })
    }

    pub fn state(&self) -> LinkState {
        *self.state.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == LinkState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn total_reconnects(&self) -> u64 {
        self.total_reconnects.load(Ordering::SeqCst)
    }

    /// Subscribes a session to `response` frames addressed to it.
    pub fn register_listener(
        &self,
        session_id: &str,
        listener: mpsc::UnboundedSender<UpstreamResponse>,
    ) {
        self.listeners
            .write()
            .unwrap()
            .insert(session_id.to_string(), listener);
    }

    pub fn unregister_listener(&self, session_id: &str) {
        self.listeners.write().unwrap().remove(session_id);
    }

    /// Opens the transport. Also the explicit recovery path out of `Failed`:
    /// calling it resets the retry budget. A connect failure schedules the
    /// automatic reconnect loop before returning the error.
    pub async fn connect(self: &Arc<Self>) -> Result<(), UpstreamError> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                LinkState::Connected | LinkState::Connecting => {
                    warn!("upstream connect requested while already {}", state.as_str());
                    return Ok(());
                }
                _ => *state = LinkState::Connecting,
            }
        }
        self.shutting_down.store(false, Ordering::SeqCst);
        self.reconnect_attempts.store(0, Ordering::SeqCst);

        match self.try_open().await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!(error = %err, "upstream connect failed");
                self.schedule_reconnect();
                Err(err)
            }
        }
    }

    /// Deliberate shutdown of the link. No reconnect follows.
    pub fn disconnect(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        *self.state.lock().unwrap() = LinkState::Disconnected;
        // Dropping the sender ends the writer task, which closes the socket.
        self.writer.lock().unwrap().take();
        info!("upstream transport disconnected");
    }

    /// Sends one frame. Fails fast while the link is down; nothing queues.
    /// A link that spent its retry budget reports `Unavailable` instead of
    /// plain `NotConnected`, telling the caller an explicit `connect` is
    /// needed before retrying.
    pub fn send(&self, frame: &UpstreamFrame) -> Result<(), UpstreamError> {
        match self.state() {
            LinkState::Connected => {}
            LinkState::Failed => {
                return Err(UpstreamError::Unavailable(self.config.max_reconnect_attempts))
            }
            _ => return Err(UpstreamError::NotConnected),
        }
        let text = serde_json::to_string(frame)
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        let writer = self.writer.lock().unwrap();
        writer
            .as_ref()
            .ok_or(UpstreamError::NotConnected)?
            .send(Message::Text(text.into()))
            .map_err(|_| UpstreamError::NotConnected)
    }

    async fn try_open(self: &Arc<Self>) -> Result<(), UpstreamError> {
        let timeout = Duration::from_secs(self.config.connect_timeout_secs);
        info!(endpoint = %self.config.endpoint, "connecting to upstream transport");

        let (ws, _) = tokio::time::timeout(timeout, connect_async(self.config.endpoint.as_str()))
            .await
            .map_err(|_| UpstreamError::Timeout(self.config.connect_timeout_secs))?
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let (mut sink, source) = ws.split();

        // Capabilities handshake goes out before the writer task owns the sink.
        let init = UpstreamFrame::Init {
            data: UpstreamInit {
                version: env!("CARGO_PKG_VERSION").to_string(),
                capabilities: vec![
                    "text".to_string(),
                    "audio".to_string(),
                    "image".to_string(),
                ],
            },
        };
        let init_text = serde_json::to_string(&init)
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;
        sink.send(Message::Text(init_text.into()))
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.writer.lock().unwrap() = Some(writer_tx);
        *self.last_pong.lock().unwrap() = Instant::now();
        self.reconnect_attempts.store(0, Ordering::SeqCst);
        *self.state.lock().unwrap() = LinkState::Connected;
        info!("upstream transport connected");

        tokio::spawn(writer_task(sink, writer_rx));
        tokio::spawn(Arc::clone(self).reader_task(generation, source));
        tokio::spawn(Arc::clone(self).heartbeat_task(generation));

        Ok(())
    }

    /// Entered by reader/heartbeat tasks when the live link dies. A stale
    /// task (from an already-replaced connection) or a deliberate disconnect
    /// is a no-op.
    fn handle_link_loss(self: &Arc<Self>, generation: u64) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if generation != self.generation.load(Ordering::SeqCst) {
            return;
        }
        {
            let mut state = self.state.lock().unwrap();
            if *state != LinkState::Connected {
                return;
            }
            *state = LinkState::Reconnecting;
        }
        self.writer.lock().unwrap().take();
        warn!("upstream link lost unexpectedly");
        self.schedule_reconnect();
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.config.max_reconnect_attempts {
            *self.state.lock().unwrap() = LinkState::Failed;
            error!(
                attempts = self.config.max_reconnect_attempts,
                "upstream reconnect budget exhausted, waiting for an explicit connect"
            );
            return;
        }

        *self.state.lock().unwrap() = LinkState::Reconnecting;
        self.total_reconnects.fetch_add(1, Ordering::SeqCst);
        let delay = backoff_delay(self.config.reconnect_backoff_ms, attempt);
        info!(
            attempt,
            max = self.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "scheduling upstream reconnect"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if this.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            {
                let mut state = this.state.lock().unwrap();
                if *state != LinkState::Reconnecting {
                    return;
                }
                *state = LinkState::Connecting;
            }
            if let Err(err) = this.try_open().await {
                warn!(error = %err, "upstream reconnect attempt failed");
                this.schedule_reconnect();
            }
        });
    }

    async fn reader_task(self: Arc<Self>, generation: u64, mut source: WsSource) {
        while let Some(item) = source.next().await {
            match item {
                Ok(Message::Text(text)) => self.dispatch_frame(&text),
                Ok(Message::Ping(payload)) => {
                    // Transport-level ping; answer on the same link.
                    let writer = self.writer.lock().unwrap();
                    if let Some(tx) = writer.as_ref() {
                        let _ = tx.send(Message::Pong(payload));
                    }
                }
                Ok(Message::Pong(_)) => {
                    *self.last_pong.lock().unwrap() = Instant::now();
                }
                Ok(Message::Close(reason)) => {
                    info!(?reason, "upstream sent close");
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "upstream read error");
                    break;
                }
            }
        }
        self.handle_link_loss(generation);
    }

    /// Routes one inbound frame: control frames are handled here, data
    /// frames go to the listener registered for their session.
    fn dispatch_frame(&self, text: &str) {
        match serde_json::from_str::<UpstreamFrame>(text) {
            Ok(UpstreamFrame::Ping) => {
                let _ = self.send(&UpstreamFrame::Pong);
            }
            Ok(UpstreamFrame::Pong) => {
                *self.last_pong.lock().unwrap() = Instant::now();
            }
            Ok(UpstreamFrame::StatusUpdate { data }) => {
                self.events.publish(SessionEvent::UpstreamStatus {
                    session_id: data.session_id,
                    status: data.status,
                });
            }
            Ok(UpstreamFrame::Response { data }) => {
                let listeners = self.listeners.read().unwrap();
                match listeners.get(&data.session_id) {
                    Some(listener) => {
                        if listener.send(data).is_err() {
                            debug!("upstream response listener dropped");
                        }
                    }
                    None => {
                        debug!(
                            session_id = %data.session_id,
                            "dropping upstream response with no registered listener"
                        );
                    }
                }
            }
            Ok(other) => {
                debug!(frame = ?other, "ignoring unexpected upstream frame");
            }
            Err(err) => {
                warn!(error = %err, "malformed upstream frame");
            }
        }
    }

    async fn heartbeat_task(self: Arc<Self>, generation: u64) {
        let interval = Duration::from_secs(self.config.heartbeat_interval_secs);
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // the first tick fires immediately

        loop {
            ticker.tick().await;
            if generation != self.generation.load(Ordering::SeqCst)
                || self.shutting_down.load(Ordering::SeqCst)
                || self.state() != LinkState::Connected
            {
                return;
            }

            let silent_for = self.last_pong.lock().unwrap().elapsed();
            if silent_for > timeout {
                warn!(
                    silent_ms = silent_for.as_millis() as u64,
                    "upstream heartbeat timed out, tearing the link down"
                );
                self.writer.lock().unwrap().take();
                self.handle_link_loss(generation);
                return;
            }

            if self.send(&UpstreamFrame::Ping).is_err() {
                self.handle_link_loss(generation);
                return;
            }
        }
    }
}

async fn writer_task(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = rx.recv().await {
        if sink.send(message).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UpstreamMessage;
    use tokio::net::TcpListener;

    fn test_config(endpoint: String, max_attempts: u32) -> UpstreamConfig {
        UpstreamConfig {
            enabled: true,
            endpoint,
            connect_timeout_secs: 2,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 60,
            reconnect_backoff_ms: 10,
            max_reconnect_attempts: max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_per_attempt_and_caps() {
        assert_eq!(backoff_delay(5000, 1), Duration::from_millis(5000));
        assert_eq!(backoff_delay(5000, 2), Duration::from_millis(10_000));
        assert_eq!(backoff_delay(5000, 3), Duration::from_millis(20_000));
        assert_eq!(backoff_delay(5000, 4), Duration::from_millis(30_000));
        assert_eq!(backoff_delay(5000, 32), Duration::from_millis(30_000));
    }

    #[tokio::test]
    async fn send_fails_fast_while_disconnected() {
        let manager = UpstreamManager::new(
            test_config("ws://127.0.0.1:9".to_string(), 1),
            EventBus::new(8),
        );
        assert_eq!(manager.state(), LinkState::Disconnected);
        assert_eq!(
            manager.send(&UpstreamFrame::Ping),
            Err(UpstreamError::NotConnected)
        );
    }

    #[tokio::test]
    async fn reconnects_are_bounded_and_end_in_failed() {
        // Nothing listens on this port; every attempt is refused.
        let manager = UpstreamManager::new(
            test_config("ws://127.0.0.1:59998".to_string(), 2),
            EventBus::new(8),
        );

        assert!(manager.connect().await.is_err());

        // 2 retries at ~10-20ms backoff, then the terminal state.
        for _ in 0..50 {
            if manager.state() == LinkState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(manager.state(), LinkState::Failed);
        assert!(manager.reconnect_attempts() > manager.config.max_reconnect_attempts);

        // No further automatic attempts: still Failed after a pause.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.state(), LinkState::Failed);

        // An exhausted link is reported as Unavailable, not NotConnected,
        // so callers know an explicit connect is required.
        assert_eq!(
            manager.send(&UpstreamFrame::Ping),
            Err(UpstreamError::Unavailable(2))
        );
    }

    #[tokio::test]
    async fn handshake_sends_init_and_responses_route_to_listeners() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        // Minimal upstream peer: check the init frame, answer with one
        // response for session s1, then expect a forwarded data frame.
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let first = ws.next().await.unwrap().unwrap();
            let text = first.into_text().unwrap();
            assert!(text.contains(r#""type":"init""#));
            assert!(text.contains("capabilities"));

            let response = serde_json::json!({
                "type": "response",
                "data": {
                    "messageId": "msg_1",
                    "sessionId": "s1",
                    "text": "upstream reply",
                    "confidence": 0.8,
                    "audioUrl": null
                }
            });
            ws.send(Message::Text(response.to_string().into()))
                .await
                .unwrap();

            let forwarded = ws.next().await.unwrap().unwrap().into_text().unwrap();
            assert!(forwarded.contains(r#""type":"message""#));
            assert!(forwarded.contains(r#""messageId":"msg_2""#));
            assert!(forwarded.contains(r#""modality":"text""#));

            // Keep the link open until the client is done.
            while let Some(Ok(msg)) = ws.next().await {
                if msg.is_close() {
                    break;
                }
            }
        });

        let manager = UpstreamManager::new(
            test_config(format!("ws://{}", addr), 1),
            EventBus::new(8),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        manager.register_listener("s1", tx);

        manager.connect().await.unwrap();
        assert_eq!(manager.state(), LinkState::Connected);

        let routed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(routed.message_id, "msg_1");
        assert_eq!(routed.text, "upstream reply");

        // A client turn travels upstream as a correlated data frame.
        manager
            .send(&UpstreamFrame::Message {
                data: UpstreamMessage {
                    message_id: "msg_2".to_string(),
                    session_id: "s1".to_string(),
                    modality: "text".to_string(),
                    content: "hello".to_string(),
                },
            })
            .expect("link should accept data frames");

        manager.disconnect();
        assert_eq!(manager.state(), LinkState::Disconnected);
        let _ = server.await;
    }

    #[tokio::test]
    async fn explicit_connect_resets_a_failed_link() {
        let manager = UpstreamManager::new(
            test_config("ws://127.0.0.1:59997".to_string(), 1),
            EventBus::new(8),
        );
        assert!(manager.connect().await.is_err());
        for _ in 0..50 {
            if manager.state() == LinkState::Failed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(manager.state(), LinkState::Failed);

        // The explicit call goes back through Connecting (and fails again
        // here, since nothing is listening), proving the latch released.
        let err = manager.connect().await.unwrap_err();
        assert!(matches!(
            err,
            UpstreamError::Transport(_) | UpstreamError::Timeout(_)
        ));
    }
}
