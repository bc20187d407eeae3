//! Request metrics.
//!
//! Keeps the aggregate counters and the recent response-time window used
//! for percentiles, and mirrors everything into prometheus-client families
//! for scraping.

use crate::backend::Server;
use crate::health::CircuitState;
use parking_lot::Mutex;
use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Labels for per-server request counts.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub server: String,
    pub outcome: Outcome,
}

/// Whether a dispatched request succeeded.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Success,
    Failure,
}

/// Labels keyed only by server.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ServerLabels {
    pub server: String,
}

/// Labels for requests that never reached a server response.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct UnroutedLabels {
    pub reason: UnroutedReason,
}

/// Why a request was answered by the balancer itself.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum UnroutedReason {
    NoHealthyServer,
    RetriesExhausted,
    DeadlineExceeded,
}

/// Labels for health check metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HealthCheckLabels {
    pub server: String,
    pub result: HealthCheckResult,
}

/// Result of a health check.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum HealthCheckResult {
    Success,
    Failure,
}

/// Aggregate view over every request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalMetrics {
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    /// Fraction in [0, 1]; 0 before any request
    pub success_rate: f64,
    /// Mean over the current window
    pub avg_response_time_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    total_requests: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    /// Most recent response times in milliseconds.
    window: Mutex<VecDeque<f64>>,
    window_capacity: usize,

    requests_total: Family<RequestLabels, Counter>,
    request_duration_seconds: Family<ServerLabels, Histogram>,
    retries_total: Counter,
    unrouted_total: Family<UnroutedLabels, Counter>,
    /// 1 healthy, 0 otherwise
    backend_health: Family<ServerLabels, Gauge>,
    /// 0 closed, 1 half-open, 2 open
    circuit_state: Family<ServerLabels, Gauge>,
    active_connections: Family<ServerLabels, Gauge>,
    health_checks_total: Family<HealthCheckLabels, Counter>,
    registry: Registry,
}

impl MetricsCollector {
    /// Create a collector keeping the last `window_capacity` response times.
    pub fn new(window_capacity: usize) -> Self {
        let mut registry = Registry::default();

        let requests_total = Family::<RequestLabels, Counter>::default();
        let request_duration_seconds =
            Family::<ServerLabels, Histogram>::new_with_constructor(|| {
                // 1ms up to roughly 10s
                Histogram::new(exponential_buckets(0.001, 2.5, 13))
            });
        let retries_total = Counter::default();
        let unrouted_total = Family::<UnroutedLabels, Counter>::default();
        let backend_health = Family::<ServerLabels, Gauge>::default();
        let circuit_state = Family::<ServerLabels, Gauge>::default();
        let active_connections = Family::<ServerLabels, Gauge>::default();
        let health_checks_total = Family::<HealthCheckLabels, Counter>::default();

        registry.register(
            "resilb_requests",
            "Requests dispatched to servers",
            requests_total.clone(),
        );
        registry.register(
            "resilb_request_duration_seconds",
            "Server response time in seconds",
            request_duration_seconds.clone(),
        );
        registry.register(
            "resilb_retries",
            "Dispatch attempts beyond the first",
            retries_total.clone(),
        );
        registry.register(
            "resilb_unrouted_requests",
            "Requests answered without a server response",
            unrouted_total.clone(),
        );
        registry.register(
            "resilb_backend_health",
            "Server health (1=healthy, 0=unhealthy or unknown)",
            backend_health.clone(),
        );
        registry.register(
            "resilb_circuit_state",
            "Circuit breaker state (0=closed, 1=half_open, 2=open)",
            circuit_state.clone(),
        );
        registry.register(
            "resilb_active_connections",
            "Requests in flight per server",
            active_connections.clone(),
        );
        registry.register(
            "resilb_health_checks",
            "Health probes performed",
            health_checks_total.clone(),
        );

        let window_capacity = window_capacity.max(1);
        Self {
            inner: Arc::new(MetricsCollectorInner {
                total_requests: AtomicU64::new(0),
                success_count: AtomicU64::new(0),
                failure_count: AtomicU64::new(0),
                window: Mutex::new(VecDeque::with_capacity(window_capacity)),
                window_capacity,
                requests_total,
                request_duration_seconds,
                retries_total,
                unrouted_total,
                backend_health,
                circuit_state,
                active_connections,
                health_checks_total,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Record a finished dispatch to `server`.
    ///
    /// Updates the global counters and window, the server's own counters and
    /// moving average, and the exported families.
    pub fn record_request(&self, server: &Server, response_time_ms: f64, success: bool) {
        let inner = &self.inner;
        inner.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            inner.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.failure_count.fetch_add(1, Ordering::Relaxed);
        }

        {
            let mut window = inner.window.lock();
            if window.len() == inner.window_capacity {
                window.pop_front();
            }
            window.push_back(response_time_ms);
        }

        server.runtime().record_outcome(response_time_ms, success);

        let labels = RequestLabels {
            server: server.id().to_string(),
            outcome: if success {
                Outcome::Success
            } else {
                Outcome::Failure
            },
        };
        inner.requests_total.get_or_create(&labels).inc();
        inner
            .request_duration_seconds
            .get_or_create(&server_labels(server.id()))
            .observe(response_time_ms / 1000.0);
    }

    /// Count a retry attempt.
    pub fn record_retry(&self) {
        self.inner.retries_total.inc();
    }

    /// Count a request the balancer answered itself.
    pub fn record_unrouted(&self, reason: UnroutedReason) {
        self.inner
            .unrouted_total
            .get_or_create(&UnroutedLabels { reason })
            .inc();
    }

    /// Update the health gauge.
    pub fn set_backend_health(&self, server_id: &str, healthy: bool) {
        self.inner
            .backend_health
            .get_or_create(&server_labels(server_id))
            .set(if healthy { 1 } else { 0 });
    }

    /// Update the breaker gauge.
    pub fn set_circuit_state(&self, server_id: &str, state: CircuitState) {
        self.inner
            .circuit_state
            .get_or_create(&server_labels(server_id))
            .set(state.as_gauge());
    }

    /// Update the in-flight gauge.
    pub fn set_active_connections(&self, server_id: &str, active: u32) {
        self.inner
            .active_connections
            .get_or_create(&server_labels(server_id))
            .set(active as i64);
    }

    /// Record a health check result.
    pub fn record_health_check(&self, server_id: &str, success: bool) {
        let labels = HealthCheckLabels {
            server: server_id.to_string(),
            result: if success {
                HealthCheckResult::Success
            } else {
                HealthCheckResult::Failure
            },
        };
        self.inner.health_checks_total.get_or_create(&labels).inc();
    }

    /// Drop a deregistered server's gauges so it stops being exported.
    pub fn forget_server(&self, server_id: &str) {
        let labels = server_labels(server_id);
        self.inner.backend_health.remove(&labels);
        self.inner.circuit_state.remove(&labels);
        self.inner.active_connections.remove(&labels);
    }

    /// Aggregate counters and window percentiles.
    pub fn global_metrics(&self) -> GlobalMetrics {
        let inner = &self.inner;
        let total = inner.total_requests.load(Ordering::Relaxed);
        let success = inner.success_count.load(Ordering::Relaxed);
        let failure = inner.failure_count.load(Ordering::Relaxed);

        let mut samples: Vec<f64> = inner.window.lock().iter().copied().collect();
        samples.sort_by(|a, b| a.total_cmp(b));

        let avg = if samples.is_empty() {
            0.0
        } else {
            samples.iter().sum::<f64>() / samples.len() as f64
        };

        GlobalMetrics {
            total_requests: total,
            success_count: success,
            failure_count: failure,
            success_rate: if total == 0 {
                0.0
            } else {
                success as f64 / total as f64
            },
            avg_response_time_ms: avg,
            p95_ms: percentile(&samples, 0.95),
            p99_ms: percentile(&samples, 0.99),
        }
    }
}

fn server_labels(server_id: &str) -> ServerLabels {
    ServerLabels {
        server: server_id.to_string(),
    }
}

/// Nearest-rank percentile over sorted samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}
