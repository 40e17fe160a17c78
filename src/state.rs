//! # Application State Management
//!
//! This module manages shared state that needs to be accessed by multiple
//! HTTP request handlers and relay sessions simultaneously.
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: Multiple ownership (every HTTP handler and relay actor can hold
//!   a reference)
//! - **RwLock**: Multiple readers OR one writer at a time
//! - **T**: The actual data type being protected
//!
//! Handlers read the config concurrently; the config update endpoint and the
//! metric counters take the short exclusive writes.

use crate::config::AppConfig;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The main application state shared across all HTTP request handlers and
/// relay sessions.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Relay and HTTP metrics (constantly updated by requests and sessions)
    pub metrics: Arc<RwLock<RelayMetrics>>,

    /// When the server started (never changes, safe to share directly)
    pub start_time: Instant,
}

/// Metrics collected across HTTP requests and relay sessions.
///
/// ## Why these metrics matter:
/// - **request_count / error_count**: HTTP surface load and reliability
/// - **sessions_started / active_sessions**: relay usage and capacity
/// - **forwarded_\***: per-direction relay throughput (message counts)
/// - **dropped_messages**: messages discarded because the opposite leg was
///   not open — nonzero values here are expected during connect/teardown
///   races, sustained growth is not
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total number of HTTP requests processed since server start
    pub request_count: u64,

    /// Total number of errors encountered since server start
    pub error_count: u64,

    /// Total relay sessions accepted since server start
    pub sessions_started: u64,

    /// Current number of live relay sessions
    pub active_sessions: u32,

    /// Messages forwarded client → upstream
    pub forwarded_upstream: u64,

    /// Messages forwarded upstream → client
    pub forwarded_downstream: u64,

    /// Messages dropped because the opposite connection was not open
    pub dropped_messages: u64,

    /// Detailed metrics for each HTTP endpoint
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

/// Detailed performance metrics for a specific HTTP endpoint.
#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    /// Number of requests to this specific endpoint
    pub request_count: u64,

    /// Total time spent processing all requests to this endpoint (milliseconds)
    pub total_duration_ms: u64,

    /// Number of errors that occurred for this endpoint
    pub error_count: u64,
}

impl AppState {
    /// Create a new AppState with the given configuration.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(RelayMetrics::default())),
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the read lock immediately so other threads aren't
    /// blocked; AppConfig is cheap to clone.
    pub fn get_config(&self) -> AppConfig {
        self.config.read().unwrap().clone()
    }

    /// Update the configuration with validation.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        match new_config.validate() {
            Ok(_) => {
                *self.config.write().unwrap() = new_config;
                Ok(())
            }
            Err(e) => Err(e.to_string()),
        }
    }

    /// Increment the total request counter (called by middleware for every request).
    pub fn increment_request_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.request_count += 1;
    }

    /// Increment the total error counter (called when any request fails).
    pub fn increment_error_count(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.error_count += 1;
    }

    /// Record detailed metrics for a specific endpoint.
    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write().unwrap();

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();

        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;

        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    /// Record a newly accepted relay session.
    pub fn session_started(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.sessions_started += 1;
        metrics.active_sessions += 1;
    }

    /// Record a relay session ending.
    ///
    /// Guards against underflow so racing teardown triggers can't wrap the
    /// counter.
    pub fn session_ended(&self) {
        let mut metrics = self.metrics.write().unwrap();
        if metrics.active_sessions > 0 {
            metrics.active_sessions -= 1;
        }
    }

    /// Record a message forwarded client → upstream.
    pub fn record_forward_upstream(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.forwarded_upstream += 1;
    }

    /// Record a message forwarded upstream → client.
    pub fn record_forward_downstream(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.forwarded_downstream += 1;
    }

    /// Record a message dropped because the opposite leg was not open.
    pub fn record_dropped_message(&self) {
        let mut metrics = self.metrics.write().unwrap();
        metrics.dropped_messages += 1;
    }

    /// Get a snapshot of current metrics (used for the /metrics endpoint).
    ///
    /// Clones the data so the lock isn't held while the HTTP response is
    /// serialized.
    pub fn get_metrics_snapshot(&self) -> RelayMetrics {
        let metrics = self.metrics.read().unwrap();
        RelayMetrics {
            request_count: metrics.request_count,
            error_count: metrics.error_count,
            sessions_started: metrics.sessions_started,
            active_sessions: metrics.active_sessions,
            forwarded_upstream: metrics.forwarded_upstream,
            forwarded_downstream: metrics.forwarded_downstream,
            dropped_messages: metrics.dropped_messages,
            endpoint_metrics: metrics.endpoint_metrics.clone(),
        }
    }

    /// Get server uptime in seconds.
    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    /// Average response time for this endpoint in milliseconds.
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Error rate for this endpoint (0.0 to 1.0).
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
    fn test_session_counters() {
        let state = AppState::new(AppConfig::default());
        state.session_started();
        state.session_started();
        state.session_ended();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.sessions_started, 2);
        assert_eq!(snapshot.active_sessions, 1);
    }

    /// Racing teardown triggers may call session_ended more often than
    /// sessions were started; the counter must not wrap.
    #[test]
    fn test_session_ended_underflow_guard() {
        let state = AppState::new(AppConfig::default());
        state.session_ended();
        state.session_ended();
        assert_eq!(state.get_metrics_snapshot().active_sessions, 0);
    }

    #[test]
    fn test_forward_and_drop_counters() {
        let state = AppState::new(AppConfig::default());
        state.record_forward_upstream();
        state.record_forward_downstream();
        state.record_forward_downstream();
        state.record_dropped_message();

        let snapshot = state.get_metrics_snapshot();
        assert_eq!(snapshot.forwarded_upstream, 1);
        assert_eq!(snapshot.forwarded_downstream, 2);
        assert_eq!(snapshot.dropped_messages, 1);
    }

    #[test]
    fn test_endpoint_metrics() {
        let state = AppState::new(AppConfig::default());
        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let snapshot = state.get_metrics_snapshot();
        let metric = &snapshot.endpoint_metrics["GET /health"];
        assert_eq!(metric.request_count, 2);
        assert_eq!(metric.average_duration_ms(), 20.0);
        assert_eq!(metric.error_rate(), 0.5);
    }
}
