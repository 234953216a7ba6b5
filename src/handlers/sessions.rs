use crate::error::AppError;
use crate::events::CloseReason;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

/// Lists every live session for operator inspection.
pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions: Vec<_> = state
        .registry
        .snapshot_all()
        .into_iter()
        .map(|s| {
            json!({
                "sessionId": s.session_id,
                "userId": s.user_id,
                "channel": s.channel,
                "status": s.status.as_str(),
                "createdAt": s.created_at.to_rfc3339(),
                "lastActivity": s.last_activity.to_rfc3339(),
                "pendingMessage": s.pending_message
            })
        })
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "active": sessions.len(),
        "capacity": state.registry.capacity(),
        "sessions": sessions
    }))
}

/// Force-closes one session; its client connection (if any) is torn down.
pub async fn close_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let session_id = path.into_inner();

    if !state.registry.remove(&session_id, CloseReason::Request) {
        return Err(AppError::NotFound(format!("session '{}' not found", session_id)));
    }

    info!(session_id = %session_id, "session closed by operator request");
    Ok(HttpResponse::Ok().json(json!({
        "status": "closed",
        "sessionId": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}
