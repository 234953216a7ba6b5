//! # Application State Management
//!
//! Shared state handed to every HTTP handler and the WebSocket gateway:
//! the runtime-updatable configuration, request metrics, and handles to the
//! orchestrator components (session registry, message pipeline, upstream
//! transport manager, event bus).
//!
//! ## Thread Safety:
//! Config and metrics sit behind `Arc<RwLock<..>>` so many requests can read
//! concurrently while updates stay exclusive. The orchestrator components do
//! their own internal synchronization and are shared as plain `Arc`s.

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::pipeline::MessagePipeline;
use crate::session::SessionRegistry;
use crate::upstream::UpstreamManager;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub registry: Arc<SessionRegistry>,
    pub pipeline: Arc<MessagePipeline>,
    pub upstream: Arc<UpstreamManager>,
    pub events: EventBus,
}

/// Counters collected across all HTTP requests. Session and upstream gauges
/// are read live from their owners instead of being duplicated here.
#[derive(Debug, Default)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        registry: Arc<SessionRegistry>,
        pipeline: Arc<MessagePipeline>,
        upstream: Arc<UpstreamManager>,
        events: EventBus,
    ) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            registry,
            pipeline,
            upstream,
            events,
        }
    }

    /// Clones the current config so the lock is released immediately.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();
        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Consistent copy of the metrics for serialization, so no lock is held
    /// while the HTTP response is built.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        let metrics = self.metrics.read().unwrap();
        AppMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_metric_rates_handle_the_empty_case() {
        let metric = EndpointMetric::default();
        assert_eq!(metric.average_duration_ms(), 0.0);
        assert_eq!(metric.error_rate(), 0.0);

        let metric = EndpointMetric {
            request_count: 10,
            total_duration_ms: 500,
            error_count: 5,
        };
        assert_eq!(metric.average_duration_ms(), 50.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
