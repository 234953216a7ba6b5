//! # External Capability Providers
//!
//! The pipeline depends on three capabilities, each behind a trait so the
//! orchestrator never knows which vendor is on the other side:
//!
//! - [`InputNormalizer`]: turns non-text input (audio, image) into a text
//!   utterance.
//! - [`ResponseGenerator`]: turns an utterance plus conversational context
//!   into a reply with usage and confidence metadata.
//! - [`SpeechSynthesizer`]: turns reply text into an audio reference.
//!
//! Concrete implementations live in the submodules; they are plain HTTP
//! clients constructed once at startup and shared by handle.

mod elevenlabs;
mod stepfun;

pub use elevenlabs::ElevenLabsClient;
pub use stepfun::StepfunClient;

use crate::error::ProviderError;
use crate::session::Turn;
use async_trait::async_trait;

/// Conversational context handed to the generator alongside the utterance.
#[derive(Debug, Clone, Default)]
pub struct GenerationContext {
    pub session_id: String,
    pub user_id: String,
    pub channel: String,
    /// Bounded recent history, oldest first.
    pub history: Vec<Turn>,
}

/// A generated reply plus the metadata the rest of the product consumes.
#[derive(Debug, Clone)]
pub struct GeneratedReply {
    pub text: String,
    pub confidence: f32,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// A synthesized utterance: a playable reference plus its length.
#[derive(Debug, Clone)]
pub struct SynthesizedSpeech {
    pub audio_url: String,
    pub duration_ms: u64,
}

#[async_trait]
pub trait InputNormalizer: Send + Sync {
    /// Transcribes a captured voice recording into text.
    async fn speech_to_text(&self, audio: &[u8]) -> Result<String, ProviderError>;

    /// Describes a shared image in text suitable as a conversational turn.
    async fn describe_image(
        &self,
        image_data: &str,
        file_name: Option<&str>,
    ) -> Result<String, ProviderError>;
}

#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(
        &self,
        utterance: &str,
        context: &GenerationContext,
    ) -> Result<GeneratedReply, ProviderError>;
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech, ProviderError>;
}
