//! # ElevenLabs Speech Synthesis Client
//!
//! Turns reply text into playable audio via `POST /text-to-speech/{voice}`.
//! The synthesized bytes are returned to the client as a data URL; the
//! duration is estimated from text length (the API does not report one).

use crate::config::ElevenLabsConfig;
use crate::error::ProviderError;
use crate::providers::{SpeechSynthesizer, SynthesizedSpeech};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use tracing::{debug, info};

/// Rough speaking rate: ~100ms per character, never shorter than a second.
fn estimate_duration_ms(text: &str) -> u64 {
    (text.chars().count() as u64 * 100).max(1000)
}

pub struct ElevenLabsClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    voice_id: String,
    model_id: String,
}

impl ElevenLabsClient {
    pub fn new(config: &ElevenLabsConfig) -> Self {
        info!(voice_id = %config.voice_id, model_id = %config.model_id, "elevenlabs client ready");
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            voice_id: config.voice_id.clone(),
            model_id: config.model_id.clone(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsClient {
    async fn synthesize(&self, text: &str) -> Result<SynthesizedSpeech, ProviderError> {
        let body = json!({
            "text": text,
            "model_id": self.model_id,
            "voice_settings": {
                "stability": 0.5,
                "similarity_boost": 0.75,
                "style": 0.0,
                "use_speaker_boost": true
            }
        });

        let response = self
            .http
            .post(format!("{}/text-to-speech/{}", self.base_url, self.voice_id))
            .header("xi-api-key", &self.api_key)
            .header(reqwest::header::ACCEPT, "audio/mpeg")
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::new("synthesis", e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::new(
                "synthesis",
                format!("API returned {}", response.status()),
            ));
        }

        let audio = response
            .bytes()
            .await
            .map_err(|e| ProviderError::new("synthesis", e.to_string()))?;

        let duration_ms = estimate_duration_ms(text);
        debug!(
            text_len = text.len(),
            audio_bytes = audio.len(),
            duration_ms,
            "speech synthesized"
        );

        Ok(SynthesizedSpeech {
            audio_url: format!("data:audio/mpeg;base64,{}", BASE64.encode(&audio)),
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_estimate_scales_with_text_and_has_a_floor() {
        assert_eq!(estimate_duration_ms(""), 1000);
        assert_eq!(estimate_duration_ms("hi"), 1000);
        assert_eq!(estimate_duration_ms(&"x".repeat(50)), 5000);
    }
}
