//! # Framed Message Protocol
//!
//! All real-time traffic is JSON text frames with a `type` discriminator.
//! Three vocabularies share this module:
//!
//! 1. **Client → Gateway** ([`ClientFrame`]): what the browser sends over `/ws`.
//! 2. **Gateway → Client** ([`ServerFrame`]): acknowledgments, status changes,
//!    and agent responses pushed back to the originating connection.
//! 3. **Orchestrator ↔ Upstream** ([`UpstreamFrame`]): the outbound link to the
//!    external real-time AI transport, including its control frames.
//!
//! Field names use the camelCase spelling the web frontend speaks
//! (`sessionId`, `audioUrl`, `imageData`), so every struct carries explicit
//! serde renames rather than relying on Rust naming.

use serde::{Deserialize, Serialize};

/// Messages received from a browser client over the inbound WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    /// Binds the session to a patient identity and channel.
    #[serde(rename = "initialize")]
    Initialize { config: InitConfig },

    /// A plain text utterance; enters the pipeline immediately.
    #[serde(rename = "text_message")]
    TextMessage { text: String },

    /// Client started capturing microphone audio.
    #[serde(rename = "start_voice_recording")]
    StartVoiceRecording,

    /// Client finished capturing; the buffered audio enters the pipeline.
    #[serde(rename = "stop_voice_recording")]
    StopVoiceRecording,

    /// One chunk of captured audio, base64-encoded PCM.
    #[serde(rename = "audio_chunk")]
    AudioChunk { data: String },

    /// An image shared by the patient, as a data URL or base64 payload.
    #[serde(rename = "image_upload")]
    ImageUpload {
        #[serde(rename = "imageData")]
        image_data: String,
        #[serde(rename = "fileName")]
        file_name: Option<String>,
    },

    /// Application-level liveness probe; answered immediately with `pong`
    /// and never touches session state.
    #[serde(rename = "ping")]
    Ping,
}

/// Identity payload carried by an `initialize` frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitConfig {
    #[serde(rename = "userId", default)]
    pub user_id: String,
    #[serde(default)]
    pub channel: String,
}

/// Messages pushed from the gateway to a browser client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    /// Sent once per connection, before anything else.
    #[serde(rename = "connection_established")]
    ConnectionEstablished {
        #[serde(rename = "sessionId")]
        session_id: String,
    },

    /// Acknowledges `initialize`.
    #[serde(rename = "initialized")]
    Initialized {
        #[serde(rename = "sessionId")]
        session_id: String,
        status: String,
    },

    /// Emitted on every session status transition so the UI can mirror
    /// idle/listening/processing/speaking in real time.
    #[serde(rename = "agent_status")]
    AgentStatus { status: String },

    /// The companion's reply for one turn. `audio_url` is `null` when
    /// synthesis is disabled or failed; the text is always present.
    #[serde(rename = "agent_response")]
    AgentResponse {
        text: String,
        #[serde(rename = "audioUrl")]
        audio_url: Option<String>,
        duration: u64,
    },

    /// Reply to a client `ping`.
    #[serde(rename = "pong")]
    Pong,

    /// A recoverable protocol or processing error. The connection stays open.
    #[serde(rename = "error")]
    Error { error: String },
}

/// Frames exchanged with the upstream real-time AI transport, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpstreamFrame {
    /// Handshake sent right after the transport opens.
    #[serde(rename = "init")]
    Init { data: UpstreamInit },

    /// Liveness probe. Sent on a fixed interval while connected; the peer
    /// answers with `pong`.
    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "pong")]
    Pong,

    /// Upstream-reported session status change.
    #[serde(rename = "status_update")]
    StatusUpdate { data: UpstreamStatus },

    /// A completed reply for one session, routed to its registered listener.
    #[serde(rename = "response")]
    Response { data: UpstreamResponse },

    /// An outbound data frame carrying one client message for external
    /// processing, correlated by a generated message id.
    #[serde(rename = "message")]
    Message { data: UpstreamMessage },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamInit {
    pub version: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamStatus {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamResponse {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub text: String,
    pub confidence: f32,
    #[serde(rename = "audioUrl")]
    pub audio_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamMessage {
    #[serde(rename = "messageId")]
    pub message_id: String,
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub modality: String,
    pub content: String,
}
