use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Reports the running configuration. Provider credentials are summarized,
/// never echoed.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": {
            "server": {
                "host": config.server.host,
                "port": config.server.port
            },
            "providers": {
                "stepfun": {
                    "base_url": config.providers.stepfun.base_url,
                    "model": config.providers.stepfun.model,
                    "api_key_configured": !config.providers.stepfun.api_key.is_empty()
                },
                "elevenlabs": {
                    "enabled": config.providers.elevenlabs.enabled,
                    "voice_id": config.providers.elevenlabs.voice_id,
                    "model_id": config.providers.elevenlabs.model_id,
                    "api_key_configured": !config.providers.elevenlabs.api_key.is_empty()
                }
            },
            "upstream": {
                "enabled": config.upstream.enabled,
                "endpoint": config.upstream.endpoint,
                "connect_timeout_secs": config.upstream.connect_timeout_secs,
                "heartbeat_interval_secs": config.upstream.heartbeat_interval_secs,
                "heartbeat_timeout_secs": config.upstream.heartbeat_timeout_secs,
                "reconnect_backoff_ms": config.upstream.reconnect_backoff_ms,
                "max_reconnect_attempts": config.upstream.max_reconnect_attempts
            },
            "session": {
                "max_concurrent_sessions": config.session.max_concurrent_sessions,
                "inactivity_timeout_secs": config.session.inactivity_timeout_secs,
                "sweep_interval_secs": config.session.sweep_interval_secs,
                "pipeline_timeout_secs": config.session.pipeline_timeout_secs,
                "history_depth": config.session.history_depth
            }
        }
    })))
}

/// Applies a partial configuration update. The merged configuration is
/// validated before it replaces the running one.
pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;

    let mut current_config = state.get_config();
    current_config
        .update_from_json(&json_str)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    state
        .update_config(current_config.clone())
        .map_err(AppError::ValidationError)?;

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "session": {
            "max_concurrent_sessions": current_config.session.max_concurrent_sessions,
            "inactivity_timeout_secs": current_config.session.inactivity_timeout_secs,
            "pipeline_timeout_secs": current_config.session.pipeline_timeout_secs
        },
        "upstream": {
            "enabled": current_config.upstream.enabled,
            "endpoint": current_config.upstream.endpoint
        }
    })))
}
