use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let config = state.get_config();
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let active_sessions = state.registry.len();
    let capacity = state.registry.capacity();
    let session_usage = if capacity > 0 {
        active_sessions as f64 / capacity as f64
    } else {
        0.0
    };
    let load = if session_usage > 0.9 {
        "high_load"
    } else if session_usage > 0.7 {
        "moderate_load"
    } else {
        "normal"
    };

    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "companion-backend",
            "version": env!("CARGO_PKG_VERSION"),
            "host": config.server.host,
            "port": config.server.port
        },
        "sessions": {
            "active": active_sessions,
            "capacity": capacity,
            "usage_percent": (session_usage * 100.0).round(),
            "load": load,
            "synthesis_enabled": state.pipeline.synthesis_enabled()
        },
        "upstream": {
            "enabled": config.upstream.enabled,
            "state": state.upstream.state().as_str(),
            "reconnect_attempts": state.upstream.reconnect_attempts(),
            "total_reconnects": state.upstream.total_reconnects()
        },
        "metrics": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "error_rate": if metrics.request_count > 0 {
                metrics.error_count as f64 / metrics.request_count as f64
            } else {
                0.0
            }
        }
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.get_metrics_snapshot();
    let uptime_seconds = state.get_uptime_seconds();

    let mut endpoint_stats = Vec::new();
    for (endpoint, metric) in metrics.endpoint_metrics.iter() {
        endpoint_stats.push(json!({
            "endpoint": endpoint,
            "request_count": metric.request_count,
            "error_count": metric.error_count,
            "error_rate": metric.error_rate(),
            "average_duration_ms": metric.average_duration_ms(),
            "total_duration_ms": metric.total_duration_ms
        }));
    }

    let status_counts: serde_json::Map<String, serde_json::Value> = state
        .registry
        .status_counts()
        .into_iter()
        .map(|(status, count)| (status.to_string(), json!(count)))
        .collect();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "overall": {
            "total_requests": metrics.request_count,
            "total_errors": metrics.error_count,
            "requests_per_second": if uptime_seconds > 0 {
                metrics.request_count as f64 / uptime_seconds as f64
            } else {
                0.0
            }
        },
        "endpoints": endpoint_stats,
        "sessions": {
            "active": state.registry.len(),
            "capacity": state.registry.capacity(),
            "by_status": status_counts
        },
        "upstream": {
            "state": state.upstream.state().as_str(),
            "reconnect_attempts": state.upstream.reconnect_attempts(),
            "total_reconnects": state.upstream.total_reconnects()
        }
    }))
}
