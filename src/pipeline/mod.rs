//! # Message Pipeline
//!
//! Drives one inbound message through normalize -> generate -> synthesize ->
//! emit, moving the owning session `idle/listening -> processing -> speaking
//! -> idle` as it goes. Each stage can fail independently; failure degrades
//! the turn (fallback utterance, apology reply, text-only response) and never
//! closes the session. The patient always gets a response.
//!
//! ## Concurrency:
//! Entry is a compare-and-set claim on the session status, so at most one
//! run is in flight per session. A second frame arriving mid-run is rejected
//! with `SessionError::Busy`; the gateway turns that into a retry hint
//! rather than queueing, which keeps a stalled provider from building an
//! unbounded backlog.

use crate::error::SessionError;
use crate::events::{EventBus, SessionEvent};
use crate::protocol::{ServerFrame, UpstreamMessage};
use crate::providers::{GenerationContext, InputNormalizer, ResponseGenerator, SpeechSynthesizer};
use crate::session::{SessionRegistry, SessionStatus};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Reply substituted when generation fails or the run times out.
pub const FALLBACK_REPLY: &str = "I'm sorry, I'm having trouble thinking right now. \
Could we try again in a moment?";

/// Confidence assigned to fallback replies. Well below any real completion.
pub const FALLBACK_CONFIDENCE: f32 = 0.1;

/// Utterance used when a voice recording cannot be transcribed.
pub const VOICE_FALLBACK_UTTERANCE: &str =
    "The patient said something by voice that could not be transcribed.";

/// Utterance used when a shared image cannot be analyzed.
pub const IMAGE_FALLBACK_UTTERANCE: &str =
    "The patient shared an image that could not be analyzed.";

/// Response duration reported when synthesis produced no audio.
pub const DEFAULT_RESPONSE_DURATION_MS: u64 = 3000;

/// The raw input of one turn.
#[derive(Debug, Clone)]
pub enum Payload {
    Text(String),
    Audio(Vec<u8>),
    Image { data: String, file_name: Option<String> },
}

impl Payload {
    pub fn modality(&self) -> &'static str {
        match self {
            Payload::Text(_) => "text",
            Payload::Audio(_) => "audio",
            Payload::Image { .. } => "image",
        }
    }
}

/// One unit of work: an inbound frame bound to its session, correlated by a
/// generated message id. Discarded once the response is emitted.
#[derive(Debug, Clone)]
pub struct MessageEnvelope {
    pub message_id: String,
    pub session_id: String,
    pub payload: Payload,
}

impl MessageEnvelope {
    pub fn new(session_id: String, payload: Payload) -> Self {
        Self {
            message_id: format!("msg_{}", Uuid::new_v4().simple()),
            session_id,
            payload,
        }
    }

    /// Wire form for routing this turn over the upstream transport. Binary
    /// audio travels base64-encoded; text and image payloads are already
    /// strings on the wire.
    pub fn to_upstream(&self) -> UpstreamMessage {
        let content = match &self.payload {
            Payload::Text(text) => text.clone(),
            Payload::Audio(bytes) => BASE64.encode(bytes),
            Payload::Image { data, .. } => data.clone(),
        };
        UpstreamMessage {
            message_id: self.message_id.clone(),
            session_id: self.session_id.clone(),
            modality: self.payload.modality().to_string(),
            content,
        }
    }
}

/// What one completed run produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub message_id: String,
    pub text: String,
    pub confidence: f32,
    pub audio_url: Option<String>,
    pub duration_ms: u64,
    /// True when any stage fell back instead of completing normally.
    pub degraded: bool,
}

pub struct MessagePipeline {
    registry: Arc<SessionRegistry>,
    normalizer: Arc<dyn InputNormalizer>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
    events: EventBus,
    run_timeout: Duration,
}

impl MessagePipeline {
    pub fn new(
        registry: Arc<SessionRegistry>,
        normalizer: Arc<dyn InputNormalizer>,
        generator: Arc<dyn ResponseGenerator>,
        synthesizer: Option<Arc<dyn SpeechSynthesizer>>,
        events: EventBus,
        run_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            normalizer,
            generator,
            synthesizer,
            events,
            run_timeout,
        }
    }

    /// Whether responses will carry synthesized audio.
    pub fn synthesis_enabled(&self) -> bool {
        self.synthesizer.is_some()
    }

    /// Executes one turn end to end. Serialization per session comes from
    /// the claim: a session already processing or speaking yields
    /// `SessionError::Busy` without touching its state.
    pub async fn run(&self, envelope: MessageEnvelope) -> Result<TurnOutcome, SessionError> {
        let session_id = envelope.session_id.clone();
        self.claim(&session_id)?;
        debug!(
            session_id = %session_id,
            message_id = %envelope.message_id,
            modality = envelope.payload.modality(),
            "pipeline run started"
        );
        self.registry
            .set_pending_message(&session_id, Some(envelope.message_id.clone()));
        self.registry.touch(&session_id);

        let outcome = match tokio::time::timeout(self.run_timeout, self.process(&envelope)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    session_id = %session_id,
                    message_id = %envelope.message_id,
                    timeout_ms = self.run_timeout.as_millis() as u64,
                    "pipeline run timed out, forcing fallback response"
                );
                self.recover_with_fallback(&envelope)
            }
        };

        self.registry.set_pending_message(&session_id, None);
        outcome
    }

    /// CAS entry: `Idle -> Processing`, or `Listening -> Processing` for a
    /// finished voice capture. Any other current status means a run is
    /// already in flight.
    fn claim(&self, session_id: &str) -> Result<(), SessionError> {
        match self
            .registry
            .transition(session_id, SessionStatus::Idle, SessionStatus::Processing)
        {
            Ok(()) => Ok(()),
            Err(SessionError::Conflict { actual: SessionStatus::Listening, .. }) => self
                .registry
                .transition(session_id, SessionStatus::Listening, SessionStatus::Processing)
                .map_err(|err| match err {
                    SessionError::Conflict { .. } => SessionError::Busy(session_id.to_string()),
                    other => other,
                }),
            Err(SessionError::Conflict {
                actual: SessionStatus::Processing | SessionStatus::Speaking,
                ..
            }) => Err(SessionError::Busy(session_id.to_string())),
            Err(other) => Err(other),
        }
    }

    async fn process(&self, envelope: &MessageEnvelope) -> Result<TurnOutcome, SessionError> {
        let session_id = &envelope.session_id;
        let utterance = self.normalize(envelope).await;

        // Re-check before generation: the session may have been closed while
        // normalization was in flight.
        let snapshot = self.registry.get(session_id)?;
        let context = GenerationContext {
            session_id: session_id.clone(),
            user_id: snapshot.user_id,
            channel: snapshot.channel,
            history: self.registry.history(session_id)?,
        };

        let (text, confidence, degraded) =
            match self.generator.generate(&utterance, &context).await {
                Ok(reply) => {
                    debug!(
                        session_id = %session_id,
                        prompt_tokens = reply.prompt_tokens,
                        completion_tokens = reply.completion_tokens,
                        "reply generated"
                    );
                    (reply.text, reply.confidence, false)
                }
                Err(err) => {
                    warn!(
                        session_id = %session_id,
                        error = %err,
                        "generation failed, substituting fallback reply"
                    );
                    (FALLBACK_REPLY.to_string(), FALLBACK_CONFIDENCE, true)
                }
            };

        let mut audio_url = None;
        let mut duration_ms = DEFAULT_RESPONSE_DURATION_MS;
        let mut emitted_from = SessionStatus::Processing;

        if let Some(synthesizer) = &self.synthesizer {
            // Fails when the session was closed mid-generation; the run then
            // aborts without writing anything further.
            self.registry
                .transition(session_id, SessionStatus::Processing, SessionStatus::Speaking)?;
            emitted_from = SessionStatus::Speaking;

            match synthesizer.synthesize(&text).await {
                Ok(speech) => {
                    audio_url = Some(speech.audio_url);
                    duration_ms = speech.duration_ms;
                }
                Err(err) => {
                    warn!(
                        session_id = %session_id,
                        error = %err,
                        "synthesis failed, delivering text-only response"
                    );
                }
            }
        }

        self.finish(envelope, &utterance, text, confidence, audio_url, duration_ms, degraded, emitted_from)
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        envelope: &MessageEnvelope,
        utterance: &str,
        text: String,
        confidence: f32,
        audio_url: Option<String>,
        duration_ms: u64,
        degraded: bool,
        emitted_from: SessionStatus,
    ) -> Result<TurnOutcome, SessionError> {
        let session_id = &envelope.session_id;

        let delivered = self.registry.emit(
            session_id,
            ServerFrame::AgentResponse {
                text: text.clone(),
                audio_url: audio_url.clone(),
                duration: duration_ms,
            },
        );
        if !delivered {
            debug!(session_id = %session_id, "no live client connection for response");
        }

        self.registry
            .record_turn(session_id, utterance.to_string(), text.clone());
        self.registry.touch(session_id);
        self.events.publish(SessionEvent::ResponseEmitted {
            session_id: session_id.clone(),
            message_id: envelope.message_id.clone(),
            degraded,
        });

        // The session may have been closed while the response was emitted;
        // in that case there is no state left to return to Idle.
        let _ = self
            .registry
            .transition(session_id, emitted_from, SessionStatus::Idle);

        Ok(TurnOutcome {
            message_id: envelope.message_id.clone(),
            text,
            confidence,
            audio_url,
            duration_ms,
            degraded,
        })
    }

    /// Timeout path: the stage future was cancelled somewhere between
    /// Processing and Speaking. Emits the apology and returns the session to
    /// Idle from whichever status it reached.
    fn recover_with_fallback(
        &self,
        envelope: &MessageEnvelope,
    ) -> Result<TurnOutcome, SessionError> {
        let session_id = &envelope.session_id;

        self.registry.emit(
            session_id,
            ServerFrame::AgentResponse {
                text: FALLBACK_REPLY.to_string(),
                audio_url: None,
                duration: DEFAULT_RESPONSE_DURATION_MS,
            },
        );
        self.events.publish(SessionEvent::ResponseEmitted {
            session_id: session_id.clone(),
            message_id: envelope.message_id.clone(),
            degraded: true,
        });

        if self
            .registry
            .transition(session_id, SessionStatus::Speaking, SessionStatus::Idle)
            .is_err()
        {
            let _ = self
                .registry
                .transition(session_id, SessionStatus::Processing, SessionStatus::Idle);
        }

        Ok(TurnOutcome {
            message_id: envelope.message_id.clone(),
            text: FALLBACK_REPLY.to_string(),
            confidence: FALLBACK_CONFIDENCE,
            audio_url: None,
            duration_ms: DEFAULT_RESPONSE_DURATION_MS,
            degraded: true,
        })
    }

    /// Stage 1: everything becomes a text utterance. Normalization failures
    /// degrade to a descriptive placeholder so generation still runs.
    async fn normalize(&self, envelope: &MessageEnvelope) -> String {
        match &envelope.payload {
            Payload::Text(text) => text.clone(),
            Payload::Audio(bytes) => match self.normalizer.speech_to_text(bytes).await {
                Ok(text) => text,
                Err(err) => {
                    warn!(
                        session_id = %envelope.session_id,
                        error = %err,
                        "transcription failed, using fallback utterance"
                    );
                    VOICE_FALLBACK_UTTERANCE.to_string()
                }
            },
            Payload::Image { data, file_name } => {
                match self.normalizer.describe_image(data, file_name.as_deref()).await {
                    Ok(description) => {
                        format!("The patient shared an image: {}", description)
                    }
                    Err(err) => {
                        warn!(
                            session_id = %envelope.session_id,
                            error = %err,
                            "image analysis failed, using fallback utterance"
                        );
                        IMAGE_FALLBACK_UTTERANCE.to_string()
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::providers::{GeneratedReply, SynthesizedSpeech};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct FakeNormalizer {
        fail: bool,
    }

    #[async_trait]
    impl InputNormalizer for FakeNormalizer {
        async fn speech_to_text(&self, _audio: &[u8]) -> Result<String, ProviderError> {
            if self.fail {
                Err(ProviderError::new("transcription", "asr offline"))
            } else {
                Ok("spoken words".to_string())
            }
        }

        async fn describe_image(
            &self,
            _image_data: &str,
            _file_name: Option<&str>,
        ) -> Result<String, ProviderError> {
            if self.fail {
                Err(ProviderError::new("image description", "vision offline"))
            } else {
                Ok("a sunny garden".to_string())
            }
        }
    }

    struct FakeGenerator {
        fail: bool,
        delay_ms: u64,
        last_history_len: AtomicUsize,
    }

    impl FakeGenerator {
        fn ok() -> Self {
            Self { fail: false, delay_ms: 0, last_history_len: AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl ResponseGenerator for FakeGenerator {
        async fn generate(
            &self,
            utterance: &str,
            context: &GenerationContext,
        ) -> Result<GeneratedReply, ProviderError> {
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            self.last_history_len.store(context.history.len(), Ordering::SeqCst);
            if self.fail {
                return Err(ProviderError::new("generation", "provider 500"));
            }
            Ok(GeneratedReply {
                text: format!("echo: {}", utterance),
                confidence: 0.9,
                prompt_tokens: 10,
                completion_tokens: 4,
            })
        }
    }

    struct FakeSynthesizer {
        fail: bool,
    }

    #[async_trait]
    impl SpeechSynthesizer for FakeSynthesizer {
        async fn synthesize(&self, _text: &str) -> Result<SynthesizedSpeech, ProviderError> {
            if self.fail {
                return Err(ProviderError::new("synthesis", "tts offline"));
            }
            Ok(SynthesizedSpeech {
                audio_url: "data:audio/mpeg;base64,QQ==".to_string(),
                duration_ms: 1234,
            })
        }
    }

    struct Harness {
        registry: Arc<SessionRegistry>,
        pipeline: MessagePipeline,
        frames: mpsc::UnboundedReceiver<ServerFrame>,
    }

    fn harness(
        generator: FakeGenerator,
        synthesizer: Option<FakeSynthesizer>,
        normalizer_fails: bool,
        timeout_ms: u64,
    ) -> Harness {
        let events = EventBus::new(32);
        let registry = Arc::new(SessionRegistry::new(8, 5, events.clone()));
        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();
        let (tx, frames) = mpsc::unbounded_channel();
        registry.attach_client("s1", tx).unwrap();

        let pipeline = MessagePipeline::new(
            registry.clone(),
            Arc::new(FakeNormalizer { fail: normalizer_fails }),
            Arc::new(generator),
            synthesizer.map(|s| Arc::new(s) as Arc<dyn SpeechSynthesizer>),
            events,
            Duration::from_millis(timeout_ms),
        );

        Harness { registry, pipeline, frames }
    }

    fn drain(frames: &mut mpsc::UnboundedReceiver<ServerFrame>) -> Vec<ServerFrame>
    {
        let mut out = Vec::new();
        while let Ok(frame) = frames.try_recv() {
            out.push(frame);
        }
        out
    }

    fn status_labels(frames: &[ServerFrame]) -> Vec<String> {
        frames
            .iter()
            .map(|f| match f {
                ServerFrame::AgentStatus { status } => format!("status:{}", status),
                ServerFrame::AgentResponse { .. } => "response".to_string(),
                other => format!("{:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn text_turn_with_synthesis_walks_the_full_status_sequence() {
        let mut h = harness(FakeGenerator::ok(), Some(FakeSynthesizer { fail: false }), false, 1000);

        let outcome = h
            .pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Text("hello".to_string())))
            .await
            .unwrap();

        assert_eq!(outcome.text, "echo: hello");
        assert_eq!(outcome.audio_url.as_deref(), Some("data:audio/mpeg;base64,QQ=="));
        assert_eq!(outcome.duration_ms, 1234);
        assert!(!outcome.degraded);

        let frames = drain(&mut h.frames);
        assert_eq!(
            status_labels(&frames),
            vec!["status:processing", "status:speaking", "response", "status:idle"]
        );
        assert_eq!(h.registry.get("s1").unwrap().status, SessionStatus::Idle);
        assert!(h.registry.get("s1").unwrap().pending_message.is_none());
    }

    #[tokio::test]
    async fn generation_failure_degrades_to_the_apology_reply() {
        let mut h = harness(
            FakeGenerator { fail: true, delay_ms: 0, last_history_len: AtomicUsize::new(0) },
            Some(FakeSynthesizer { fail: false }),
            false,
            1000,
        );

        let outcome = h
            .pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Text("hello".to_string())))
            .await
            .unwrap();

        assert_eq!(outcome.text, FALLBACK_REPLY);
        assert!(outcome.confidence <= 0.5);
        assert!(outcome.degraded);
        // Session survives the failed turn.
        assert_eq!(h.registry.get("s1").unwrap().status, SessionStatus::Idle);

        let frames = drain(&mut h.frames);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::AgentResponse { text, .. } if text == FALLBACK_REPLY
        )));
    }

    #[tokio::test]
    async fn synthesis_failure_still_delivers_a_text_only_response() {
        let mut h = harness(FakeGenerator::ok(), Some(FakeSynthesizer { fail: true }), false, 1000);

        let outcome = h
            .pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Text("hi".to_string())))
            .await
            .unwrap();

        assert_eq!(outcome.text, "echo: hi");
        assert!(outcome.audio_url.is_none());
        assert_eq!(outcome.duration_ms, DEFAULT_RESPONSE_DURATION_MS);

        let frames = drain(&mut h.frames);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::AgentResponse { audio_url: None, .. }
        )));
        assert_eq!(h.registry.get("s1").unwrap().status, SessionStatus::Idle);
    }

    #[tokio::test]
    async fn without_a_synthesizer_the_session_never_enters_speaking() {
        let mut h = harness(FakeGenerator::ok(), None, false, 1000);

        h.pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Text("hi".to_string())))
            .await
            .unwrap();

        let frames = drain(&mut h.frames);
        assert_eq!(
            status_labels(&frames),
            vec!["status:processing", "response", "status:idle"]
        );
    }

    #[tokio::test]
    async fn a_second_frame_mid_run_is_rejected_as_busy() {
        let h = harness(FakeGenerator::ok(), None, false, 1000);

        h.registry
            .transition("s1", SessionStatus::Idle, SessionStatus::Processing)
            .unwrap();

        let err = h
            .pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Text("again".to_string())))
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::Busy("s1".to_string()));
        // The in-flight run's state is untouched.
        assert_eq!(h.registry.get("s1").unwrap().status, SessionStatus::Processing);
    }

    #[tokio::test]
    async fn voice_capture_enters_from_listening_and_is_transcribed() {
        let h = harness(FakeGenerator::ok(), None, false, 1000);
        h.registry
            .transition("s1", SessionStatus::Idle, SessionStatus::Listening)
            .unwrap();

        let outcome = h
            .pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Audio(vec![0u8; 16])))
            .await
            .unwrap();

        assert_eq!(outcome.text, "echo: spoken words");
    }

    #[tokio::test]
    async fn failed_transcription_degrades_to_a_descriptive_utterance() {
        let h = harness(FakeGenerator::ok(), None, true, 1000);

        let outcome = h
            .pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Audio(vec![0u8; 16])))
            .await
            .unwrap();

        assert_eq!(outcome.text, format!("echo: {}", VOICE_FALLBACK_UTTERANCE));
    }

    #[tokio::test]
    async fn image_payloads_are_described_before_generation() {
        let h = harness(FakeGenerator::ok(), None, false, 1000);

        let outcome = h
            .pipeline
            .run(MessageEnvelope::new(
                "s1".to_string(),
                Payload::Image {
                    data: "data:image/png;base64,AAAA".to_string(),
                    file_name: Some("garden.png".to_string()),
                },
            ))
            .await
            .unwrap();

        assert_eq!(outcome.text, "echo: The patient shared an image: a sunny garden");
    }

    #[tokio::test]
    async fn a_stalled_run_times_out_into_the_fallback_reply() {
        let mut h = harness(
            FakeGenerator { fail: false, delay_ms: 500, last_history_len: AtomicUsize::new(0) },
            None,
            false,
            50,
        );

        let outcome = h
            .pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Text("slow".to_string())))
            .await
            .unwrap();

        assert!(outcome.degraded);
        assert_eq!(outcome.text, FALLBACK_REPLY);
        assert_eq!(h.registry.get("s1").unwrap().status, SessionStatus::Idle);

        let frames = drain(&mut h.frames);
        assert!(frames.iter().any(|f| matches!(
            f,
            ServerFrame::AgentResponse { text, .. } if text == FALLBACK_REPLY
        )));
    }

    #[tokio::test]
    async fn unknown_sessions_are_rejected_before_any_stage_runs() {
        let h = harness(FakeGenerator::ok(), None, false, 1000);
        let err = h
            .pipeline
            .run(MessageEnvelope::new("ghost".to_string(), Payload::Text("hi".to_string())))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[test]
    fn upstream_wire_form_keeps_correlation_and_encodes_audio() {
        let envelope =
            MessageEnvelope::new("s1".to_string(), Payload::Audio(vec![1, 2, 3]));
        let message = envelope.to_upstream();
        assert_eq!(message.message_id, envelope.message_id);
        assert_eq!(message.session_id, "s1");
        assert_eq!(message.modality, "audio");
        assert_eq!(message.content, BASE64.encode([1u8, 2, 3]));

        let envelope =
            MessageEnvelope::new("s1".to_string(), Payload::Text("hello".to_string()));
        let message = envelope.to_upstream();
        assert_eq!(message.modality, "text");
        assert_eq!(message.content, "hello");
    }

    #[tokio::test]
    async fn later_turns_carry_recent_history_as_context() {
        let generator = Arc::new(FakeGenerator::ok());
        let events = EventBus::new(32);
        let registry = Arc::new(SessionRegistry::new(8, 5, events.clone()));
        registry.create(Some("s1".to_string()), "u1", "c1").unwrap();

        let pipeline = MessagePipeline::new(
            registry.clone(),
            Arc::new(FakeNormalizer { fail: false }),
            generator.clone(),
            None,
            events,
            Duration::from_millis(1000),
        );

        pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Text("first".to_string())))
            .await
            .unwrap();
        assert_eq!(generator.last_history_len.load(Ordering::SeqCst), 0);

        pipeline
            .run(MessageEnvelope::new("s1".to_string(), Payload::Text("second".to_string())))
            .await
            .unwrap();
        assert_eq!(generator.last_history_len.load(Ordering::SeqCst), 1);
    }
}
