//! # Stepfun Client
//!
//! One HTTP client covering two capabilities against the Stepfun API:
//! language generation (`/chat/completions`) and input normalization
//! (`/audio/transcriptions` for voice, a vision chat call for images).

use crate::config::StepfunConfig;
use crate::error::ProviderError;
use crate::providers::{GeneratedReply, GenerationContext, InputNormalizer, ResponseGenerator};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

/// Model used to transcribe captured voice recordings.
const ASR_MODEL: &str = "step-asr";
/// Model used to describe shared images.
const VISION_MODEL: &str = "step-1v-8k";

/// Persona prompt for the companion. Patient identity and channel are
/// appended per request.
const SYSTEM_PROMPT: &str = "You are a warm, patient AI companion speaking with \
an elderly patient. Reply in short, clear, encouraging sentences. Stay on the \
patient's topic, never give medical diagnoses, and gently suggest contacting a \
caregiver for anything urgent.";

pub struct StepfunClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
}

impl StepfunClient {
    pub fn new(config: &StepfunConfig) -> Self {
        info!(model = %config.model, base_url = %config.base_url, "stepfun client ready");
        Self {
            http: reqwest::Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        }
    }

    async fn chat(
        &self,
        operation: &'static str,
        model: &str,
        messages: serde_json::Value,
    ) -> Result<ChatCompletion, ProviderError> {
        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "stream": false,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::new(operation, e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::new(
                operation,
                format!("API returned {}", response.status()),
            ));
        }

        response
            .json::<ChatCompletion>()
            .await
            .map_err(|e| ProviderError::new(operation, e.to_string()))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: ChatUsage,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

impl ChatCompletion {
    fn first_content(self, operation: &'static str) -> Result<(String, ChatUsage), ProviderError> {
        let usage = self.usage;
        let content = self
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::new(operation, "empty choices"))?;
        Ok((content, usage))
    }
}

#[async_trait]
impl ResponseGenerator for StepfunClient {
    async fn generate(
        &self,
        utterance: &str,
        context: &GenerationContext,
    ) -> Result<GeneratedReply, ProviderError> {
        let mut messages = Vec::new();
        messages.push(json!({
            "role": "system",
            "content": format!(
                "{}\nPatient id: {}. Conversation channel: {}.",
                SYSTEM_PROMPT, context.user_id, context.channel
            ),
        }));
        for turn in &context.history {
            messages.push(json!({"role": "user", "content": turn.user}));
            messages.push(json!({"role": "assistant", "content": turn.assistant}));
        }
        messages.push(json!({"role": "user", "content": utterance}));

        debug!(
            session_id = %context.session_id,
            history_turns = context.history.len(),
            "requesting completion"
        );

        let completion = self
            .chat("generation", &self.model, serde_json::Value::Array(messages))
            .await?;
        let (text, usage) = completion.first_content("generation")?;

        Ok(GeneratedReply {
            text: text.trim().to_string(),
            // The API reports no confidence; successful completions are
            // scored at a fixed high value, fallbacks well below it.
            confidence: 0.9,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        })
    }
}

#[async_trait]
impl InputNormalizer for StepfunClient {
    async fn speech_to_text(&self, audio: &[u8]) -> Result<String, ProviderError> {
        let part = reqwest::multipart::Part::bytes(audio.to_vec())
            .file_name("utterance.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::new("transcription", e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", ASR_MODEL);

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::new("transcription", e.to_string()))?;

        if !response.status().is_success() {
            return Err(ProviderError::new(
                "transcription",
                format!("API returned {}", response.status()),
            ));
        }

        #[derive(Deserialize)]
        struct Transcription {
            text: String,
        }

        let transcription: Transcription = response
            .json()
            .await
            .map_err(|e| ProviderError::new("transcription", e.to_string()))?;

        let text = transcription.text.trim().to_string();
        if text.is_empty() {
            return Err(ProviderError::new("transcription", "empty transcript"));
        }
        Ok(text)
    }

    async fn describe_image(
        &self,
        image_data: &str,
        file_name: Option<&str>,
    ) -> Result<String, ProviderError> {
        let messages = json!([
            {
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": image_data}},
                    {
                        "type": "text",
                        "text": "Briefly describe what this image shows, in one or two \
                                 sentences, as if telling a companion what the patient shared."
                    }
                ]
            }
        ]);

        debug!(file_name = file_name.unwrap_or("unnamed"), "describing image");

        let completion = self.chat("image description", VISION_MODEL, messages).await?;
        let (text, _) = completion.first_content("image description")?;
        Ok(text.trim().to_string())
    }
}
