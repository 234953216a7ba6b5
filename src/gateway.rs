//! # Inbound WebSocket Gateway
//!
//! Terminates browser-facing connections at `/ws`. Each connection is an
//! independent actor bound to exactly one registry session.
//!
//! ## WebSocket Protocol:
//! 1. **Connection**: a session is created and `connection_established`
//!    (with the session id) is sent before anything else
//! 2. **Initialize**: the client binds patient identity and channel
//! 3. **Turns**: `text_message`, voice recording frames, and `image_upload`
//!    enter the message pipeline; responses and `agent_status` frames come
//!    back on this connection only
//! 4. **Liveness**: client `ping` frames get an immediate `pong`; the actor
//!    also pings at the transport level and drops silent clients
//!
//! Parse failures produce an `error` frame and leave the connection open;
//! unknown frame types are logged and ignored.

use crate::events::CloseReason;
use crate::pipeline::{MessageEnvelope, MessagePipeline, Payload, DEFAULT_RESPONSE_DURATION_MS};
use crate::protocol::{ClientFrame, ServerFrame, UpstreamFrame};
use crate::session::SessionRegistry;
use crate::state::AppState;
use crate::upstream::UpstreamManager;

use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Transport-level keepalive cadence for the client link.
const CLIENT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
/// A client silent for this long is considered gone.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Retry hint sent when a frame arrives while a reply is being prepared.
const BUSY_HINT: &str =
    "A reply is still being prepared. Please wait a moment and send your message again.";

/// One browser-facing connection.
pub struct CompanionWebSocket {
    session_id: String,
    registry: Arc<SessionRegistry>,
    pipeline: Arc<MessagePipeline>,
    upstream: Arc<UpstreamManager>,
    last_heartbeat: Instant,
}

impl CompanionWebSocket {
    pub fn new(
        registry: Arc<SessionRegistry>,
        pipeline: Arc<MessagePipeline>,
        upstream: Arc<UpstreamManager>,
    ) -> Self {
        Self {
            session_id: format!("client_{}", Uuid::new_v4().simple()),
            registry,
            pipeline,
            upstream,
            last_heartbeat: Instant::now(),
        }
    }

    fn send_frame(&self, ctx: &mut ws::WebsocketContext<Self>, frame: &ServerFrame) {
        match serde_json::to_string(frame) {
            Ok(json) => ctx.text(json),
            Err(err) => error!(error = %err, "failed to encode server frame"),
        }
    }

    fn send_error(&self, ctx: &mut ws::WebsocketContext<Self>, message: &str) {
        warn!(session_id = %self.session_id, error = message, "gateway error frame");
        self.send_frame(ctx, &ServerFrame::Error { error: message.to_string() });
    }

    /// Hands one payload to the pipeline on a background task. Busy
    /// rejections come back to this connection as a retry hint.
    fn dispatch(&self, payload: Payload) {
        let envelope = MessageEnvelope::new(self.session_id.clone(), payload);

        // Deployments that route processing externally see every turn as a
        // correlated data frame on the upstream link. Forwarding is
        // best-effort; a down link never blocks the local pipeline.
        if self.upstream.is_connected() {
            let frame = UpstreamFrame::Message { data: envelope.to_upstream() };
            if let Err(err) = self.upstream.send(&frame) {
                debug!(session_id = %self.session_id, error = %err, "upstream forward skipped");
            }
        }

        let pipeline = self.pipeline.clone();
        let registry = self.registry.clone();
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            match pipeline.run(envelope).await {
                Ok(outcome) => {
                    debug!(
                        session_id = %session_id,
                        message_id = %outcome.message_id,
                        degraded = outcome.degraded,
                        "turn completed"
                    );
                }
                Err(crate::error::SessionError::Busy(_)) => {
                    registry.emit(&session_id, ServerFrame::Error {
                        error: BUSY_HINT.to_string(),
                    });
                }
                Err(err) => {
                    debug!(session_id = %session_id, error = %err, "pipeline rejected frame");
                }
            }
        });
    }

    fn handle_frame(&mut self, frame: ClientFrame, ctx: &mut ws::WebsocketContext<Self>) {
        match frame {
            ClientFrame::Ping => {
                // Answered inline; liveness must not disturb session status.
                self.send_frame(ctx, &ServerFrame::Pong);
            }
            ClientFrame::Initialize { config } => {
                match self
                    .registry
                    .bind_identity(&self.session_id, &config.user_id, &config.channel)
                {
                    Ok(snapshot) => {
                        info!(
                            session_id = %self.session_id,
                            user_id = %config.user_id,
                            channel = %config.channel,
                            "session initialized"
                        );
                        self.send_frame(ctx, &ServerFrame::Initialized {
                            session_id: snapshot.session_id,
                            status: snapshot.status.as_str().to_string(),
                        });
                    }
                    Err(err) => self.send_error(ctx, &err.to_string()),
                }
            }
            ClientFrame::TextMessage { text } => {
                self.registry.touch(&self.session_id);
                self.dispatch(Payload::Text(text));
            }
            ClientFrame::StartVoiceRecording => {
                use crate::session::SessionStatus::{Idle, Listening};
                match self.registry.transition(&self.session_id, Idle, Listening) {
                    Ok(()) => debug!(session_id = %self.session_id, "voice capture started"),
                    Err(err) => self.send_error(ctx, &err.to_string()),
                }
            }
            ClientFrame::AudioChunk { data } => match BASE64.decode(data.as_bytes()) {
                Ok(bytes) => {
                    if let Err(err) = self.registry.buffer_audio(&self.session_id, &bytes) {
                        // Chunks racing a stop frame are expected; drop them.
                        debug!(session_id = %self.session_id, error = %err, "audio chunk dropped");
                    }
                }
                Err(err) => self.send_error(ctx, &format!("invalid audio chunk: {}", err)),
            },
            ClientFrame::StopVoiceRecording => {
                match self.registry.take_audio(&self.session_id) {
                    Ok(audio) => {
                        debug!(
                            session_id = %self.session_id,
                            captured_bytes = audio.len(),
                            "voice capture finished"
                        );
                        self.dispatch(Payload::Audio(audio));
                    }
                    Err(err) => self.send_error(ctx, &err.to_string()),
                }
            }
            ClientFrame::ImageUpload { image_data, file_name } => {
                self.registry.touch(&self.session_id);
                self.dispatch(Payload::Image { data: image_data, file_name });
            }
        }
    }
}

/// Delivery of a registry-routed frame to this connection.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(ServerFrame);

/// The registry dropped this session's channel; shut the socket down.
#[derive(Message)]
#[rtype(result = "()")]
struct Terminate;

impl Actor for CompanionWebSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "client connection started");

        if let Err(err) = self
            .registry
            .create(Some(self.session_id.clone()), "", "")
        {
            self.send_error(ctx, &err.to_string());
            ctx.stop();
            return;
        }

        // Relay: registry -> this actor. The channel doubles as the close
        // signal; when the registry evicts the session the relay ends and
        // the connection is shut down.
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
        if let Err(err) = self.registry.attach_client(&self.session_id, tx) {
            self.send_error(ctx, &err.to_string());
            ctx.stop();
            return;
        }
        let addr = ctx.address();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                addr.do_send(Outbound(frame));
            }
            addr.do_send(Terminate);
        });

        // Upstream responses addressed to this session come back on the
        // same connection, keeping both transports behind one registry.
        let (upstream_tx, mut upstream_rx) = mpsc::unbounded_channel();
        self.upstream.register_listener(&self.session_id, upstream_tx);
        let registry = self.registry.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            while let Some(response) = upstream_rx.recv().await {
                registry.emit(&session_id, ServerFrame::AgentResponse {
                    text: response.text,
                    audio_url: response.audio_url,
                    duration: DEFAULT_RESPONSE_DURATION_MS,
                });
            }
        });

        self.send_frame(ctx, &ServerFrame::ConnectionEstablished {
            session_id: self.session_id.clone(),
        });

        ctx.run_interval(CLIENT_HEARTBEAT_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_heartbeat) > CLIENT_TIMEOUT {
                warn!(session_id = %act.session_id, "client heartbeat timeout, closing");
                ctx.stop();
            } else {
                ctx.ping(b"");
            }
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        info!(session_id = %self.session_id, "client connection stopped");
        self.upstream.unregister_listener(&self.session_id);
        self.registry.remove(&self.session_id, CloseReason::Disconnect);
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for CompanionWebSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => self.handle_frame(frame, ctx),
                Err(err) => {
                    if serde_json::from_str::<serde_json::Value>(&text).is_ok() {
                        // Valid JSON, unknown or malformed type: ignore.
                        debug!(session_id = %self.session_id, error = %err, "ignoring unknown frame");
                    } else {
                        self.send_error(ctx, &format!("invalid message: {}", err));
                    }
                }
            },
            Ok(ws::Message::Binary(data)) => {
                // Raw binary is treated as captured audio, same as a chunk frame.
                if let Err(err) = self.registry.buffer_audio(&self.session_id, &data) {
                    debug!(session_id = %self.session_id, error = %err, "binary audio dropped");
                }
            }
            Ok(ws::Message::Ping(payload)) => {
                self.last_heartbeat = Instant::now();
                ctx.pong(&payload);
            }
            Ok(ws::Message::Pong(_)) => {
                self.last_heartbeat = Instant::now();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %self.session_id, ?reason, "client closed connection");
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %self.session_id, error = %err, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for CompanionWebSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        self.send_frame(ctx, &msg.0);
    }
}

impl Handler<Terminate> for CompanionWebSocket {
    type Result = ();

    fn handle(&mut self, _msg: Terminate, ctx: &mut Self::Context) {
        debug!(session_id = %self.session_id, "session evicted, closing connection");
        ctx.close(None);
        ctx.stop();
    }
}

/// HTTP entry point: upgrades the request and starts the connection actor.
pub async fn companion_websocket(
    req: HttpRequest,
    stream: web::Payload,
    app_state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(
        peer = ?req.connection_info().peer_addr(),
        "new websocket connection request"
    );

    let websocket = CompanionWebSocket::new(
        app_state.registry.clone(),
        app_state.pipeline.clone(),
        app_state.upstream.clone(),
    );
    ws::start(websocket, &req, stream)
}
