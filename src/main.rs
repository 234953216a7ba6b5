//! # Companion Backend - Main Application Entry Point
//!
//! Actix-web server hosting the real-time conversational session
//! orchestrator: the browser-facing WebSocket gateway at `/ws`, the REST
//! surface under `/api/v1`, and the background tasks (inactivity sweeper,
//! upstream transport manager, event logger).
//!
//! ## Application Architecture:
//! - **config**: layered configuration (TOML file + environment variables)
//! - **state**: shared application state and request metrics
//! - **session**: session registry, state machine, and inactivity sweeper
//! - **pipeline**: the per-message normalize/generate/synthesize pipeline
//! - **providers**: external AI capability clients
//! - **upstream**: the outbound real-time transport connection manager
//! - **gateway**: the inbound per-client WebSocket actor

mod config;
mod error;
mod events;
mod gateway;
mod handlers;
mod health;
mod middleware;
mod pipeline;
mod protocol;
mod providers;
mod session;
mod state;
mod upstream;

use actix_cors::Cors;
use actix_web::{web, App, HttpServer};
use anyhow::Result;
use config::AppConfig;
use events::EventBus;
use pipeline::MessagePipeline;
use providers::{ElevenLabsClient, SpeechSynthesizer, StepfunClient};
use session::{InactivitySweeper, SessionRegistry};
use state::AppState;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::UpstreamManager;

/// Global shutdown flag, set by the signal handlers.
static SHUTDOWN_SIGNAL: AtomicBool = AtomicBool::new(false);

#[actix_web::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing()?;

    let config = AppConfig::load()?;
    config.validate()?;

    info!("Starting companion-backend v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration loaded: {}:{}", config.server.host, config.server.port);

    let events = EventBus::new(256);
    let _event_logger = events::spawn_event_logger(&events);

    let registry = Arc::new(SessionRegistry::new(
        config.session.max_concurrent_sessions,
        config.session.history_depth,
        events.clone(),
    ));

    let stepfun = Arc::new(StepfunClient::new(&config.providers.stepfun));
    let synthesizer: Option<Arc<dyn SpeechSynthesizer>> = if config.providers.elevenlabs.enabled
        && !config.providers.elevenlabs.api_key.is_empty()
    {
        Some(Arc::new(ElevenLabsClient::new(&config.providers.elevenlabs)))
    } else {
        warn!("speech synthesis disabled, responses will be text-only");
        None
    };

    let pipeline = Arc::new(MessagePipeline::new(
        registry.clone(),
        stepfun.clone(),
        stepfun,
        synthesizer,
        events.clone(),
        Duration::from_secs(config.session.pipeline_timeout_secs),
    ));

    let upstream_manager = UpstreamManager::new(config.upstream.clone(), events.clone());
    let upstream_for_shutdown = upstream_manager.clone();
    if config.upstream.enabled {
        let upstream = upstream_manager.clone();
        tokio::spawn(async move {
            if let Err(e) = upstream.connect().await {
                error!("Initial upstream connect failed: {}", e);
            }
        });
    }

    let _sweeper = InactivitySweeper::new(registry.clone(), &config.session).spawn();

    let app_state = AppState::new(
        config.clone(),
        registry,
        pipeline,
        upstream_manager,
        events,
    );
    let bind_addr = format!("{}:{}", config.server.host, config.server.port);

    setup_signal_handlers();

    info!("Starting HTTP server on {}", bind_addr);

    let server = HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .app_data(web::Data::new(app_state.clone()))
            .wrap(cors)
            .wrap(middleware::MetricsMiddleware)
            .wrap(middleware::RequestLogging)
            .route("/ws", web::get().to(gateway::companion_websocket))
            .service(
                web::scope("/api/v1")
                    .route("/health", web::get().to(health::health_check))
                    .route("/metrics", web::get().to(health::detailed_metrics))
                    .route("/config", web::get().to(handlers::get_config))
                    .route("/config", web::put().to(handlers::update_config))
                    .route("/sessions", web::get().to(handlers::list_sessions))
                    .route("/sessions/{id}", web::delete().to(handlers::close_session)),
            )
            .route("/health", web::get().to(health::health_check))
    })
    .bind(&bind_addr)?
    .run();

    let server_handle = server.handle();
    let server_task = tokio::spawn(server);

    tokio::select! {
        result = server_task => {
            match result {
                Ok(server_result) => {
                    if let Err(e) = server_result {
                        error!("Server error: {}", e);
                    }
                }
                Err(e) => {
                    error!("Server task error: {}", e);
                }
            }
        }
        _ = wait_for_shutdown() => {
            info!("Shutdown signal received, stopping server...");
            server_handle.stop(true).await;
        }
    }

    upstream_for_shutdown.disconnect();
    info!("Server stopped gracefully");
    Ok(())
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "companion_backend=debug,actix_web=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

/// Installs SIGTERM/SIGINT handlers that flip the shutdown flag.
fn setup_signal_handlers() {
    tokio::spawn(async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler");
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .expect("Failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }

        SHUTDOWN_SIGNAL.store(true, Ordering::SeqCst);
    });
}

async fn wait_for_shutdown() {
    while !SHUTDOWN_SIGNAL.load(Ordering::SeqCst) {
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    }
}
