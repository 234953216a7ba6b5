//! # Configuration Management
//!
//! Layered configuration: built-in defaults, then an optional `config.toml`,
//! then environment variables with the `APP` prefix (double underscore as
//! the section separator, e.g. `APP_SERVER__PORT=9000`). `HOST` and `PORT`
//! are honored on top for deployment platforms that set them directly.
//!
//! Timings that shape the orchestrator's behavior (heartbeat cadence,
//! reconnect backoff, inactivity threshold, per-run timeout) all live here
//! so deployments can tune them without code changes.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub providers: ProvidersConfig,
    pub upstream: UpstreamConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    pub stepfun: StepfunConfig,
    pub elevenlabs: ElevenLabsConfig,
}

/// Language generation, transcription, and image understanding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepfunConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Speech synthesis. Disabled deployments deliver text-only responses and
/// sessions never enter the speaking status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElevenLabsConfig {
    pub enabled: bool,
    pub api_key: String,
    pub base_url: String,
    pub voice_id: String,
    pub model_id: String,
}

/// The outbound link to the upstream real-time AI transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// A peer silent for longer than this is treated as a dead link.
    pub heartbeat_timeout_secs: u64,
    /// Base delay; doubles per attempt.
    pub reconnect_backoff_ms: u64,
    pub max_reconnect_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_concurrent_sessions: usize,
    /// Sessions idle past this are force-closed by the sweeper.
    pub inactivity_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    /// Budget for one normalize-generate-synthesize run.
    pub pipeline_timeout_secs: u64,
    /// Turns of conversation kept as generation context.
    pub history_depth: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            providers: ProvidersConfig {
                stepfun: StepfunConfig {
                    api_key: String::new(),
                    base_url: "https://api.stepfun.com/v1".to_string(),
                    model: "step-1-8k".to_string(),
                    temperature: 0.7,
                    max_tokens: 1500,
                },
                elevenlabs: ElevenLabsConfig {
                    enabled: true,
                    api_key: String::new(),
                    base_url: "https://api.elevenlabs.io/v1".to_string(),
                    voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
                    model_id: "eleven_multilingual_v2".to_string(),
                },
            },
            upstream: UpstreamConfig {
                enabled: false,
                endpoint: String::new(),
                connect_timeout_secs: 10,
                heartbeat_interval_secs: 30,
                heartbeat_timeout_secs: 60,
                reconnect_backoff_ms: 5000,
                max_reconnect_attempts: 5,
            },
            session: SessionConfig {
                max_concurrent_sessions: 64,
                inactivity_timeout_secs: 300,
                sweep_interval_secs: 60,
                pipeline_timeout_secs: 30,
                history_depth: 5,
            },
        }
    }
}

impl AppConfig {
    /// Loads defaults, `config.toml` (optional), then `APP_*` environment
    /// variables, with `HOST`/`PORT` as final overrides.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }
        if self.session.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if self.session.pipeline_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Pipeline timeout must be greater than 0"));
        }
        if self.session.inactivity_timeout_secs == 0 || self.session.sweep_interval_secs == 0 {
            return Err(anyhow::anyhow!("Inactivity sweep timings must be greater than 0"));
        }
        if self.upstream.enabled && self.upstream.endpoint.is_empty() {
            return Err(anyhow::anyhow!("Upstream is enabled but no endpoint is configured"));
        }
        if self.upstream.heartbeat_interval_secs == 0
            || self.upstream.heartbeat_timeout_secs == 0
        {
            return Err(anyhow::anyhow!("Upstream heartbeat timings must be greater than 0"));
        }
        Ok(())
    }

    /// Partial runtime update from a JSON body. Only recognized fields are
    /// touched; the merged result is validated before it is accepted.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = port as u16;
            }
        }

        if let Some(session) = partial.get("session") {
            if let Some(max) = session.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.session.max_concurrent_sessions = max as usize;
            }
            if let Some(secs) = session.get("inactivity_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.inactivity_timeout_secs = secs;
            }
            if let Some(secs) = session.get("pipeline_timeout_secs").and_then(|v| v.as_u64()) {
                self.session.pipeline_timeout_secs = secs;
            }
            if let Some(depth) = session.get("history_depth").and_then(|v| v.as_u64()) {
                self.session.history_depth = depth as usize;
            }
        }

        if let Some(upstream) = partial.get("upstream") {
            if let Some(endpoint) = upstream.get("endpoint").and_then(|v| v.as_str()) {
                self.upstream.endpoint = endpoint.to_string();
            }
            if let Some(enabled) = upstream.get("enabled").and_then(|v| v.as_bool()) {
                self.upstream.enabled = enabled;
            }
            if let Some(ms) = upstream.get("reconnect_backoff_ms").and_then(|v| v.as_u64()) {
                self.upstream.reconnect_backoff_ms = ms;
            }
            if let Some(attempts) =
                upstream.get("max_reconnect_attempts").and_then(|v| v.as_u64())
            {
                self.upstream.max_reconnect_attempts = attempts as u32;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.session.history_depth, 5);
        assert!(!config.upstream.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.session.max_concurrent_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upstream.enabled = true;
        // Enabled upstream requires an endpoint.
        assert!(config.validate().is_err());
        config.upstream.endpoint = "ws://localhost:9000/ws".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_update_preserves_untouched_fields() {
        let mut config = AppConfig::default();
        let json = r#"{"session": {"inactivity_timeout_secs": 120}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.session.inactivity_timeout_secs, 120);
        assert_eq!(config.session.max_concurrent_sessions, 64);
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn partial_update_rejects_an_invalid_merge() {
        let mut config = AppConfig::default();
        let json = r#"{"upstream": {"enabled": true}}"#;
        // Enabling the upstream without an endpoint fails validation.
        assert!(config.update_from_json(json).is_err());
    }
}
