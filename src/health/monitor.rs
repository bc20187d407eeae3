//! Active health monitor.
//!
//! Periodically probes every registered server and writes the result into
//! the registry. Probes go through the same [`Transport`] as routed traffic.

use crate::backend::{Server, ServerRegistry};
use crate::message::Request;
use crate::metrics::MetricsCollector;
use crate::transport::{Transport, TransportError, TransportResponse};
use crate::util::RequestId;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Response header carrying the server's CPU usage fraction.
pub const CPU_USAGE_HEADER: &str = "x-cpu-usage";
/// Response header carrying the server's memory usage fraction.
pub const MEMORY_USAGE_HEADER: &str = "x-memory-usage";

/// Outcome of one probe cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CheckSummary {
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Background prober that keeps server health current.
#[derive(Clone)]
pub struct HealthMonitor {
    registry: Arc<ServerRegistry>,
    transport: Arc<dyn Transport>,
    interval: Duration,
    timeout: Duration,
    metrics: MetricsCollector,
}

impl HealthMonitor {
    /// Create a new health monitor.
    pub fn new(
        registry: Arc<ServerRegistry>,
        transport: Arc<dyn Transport>,
        interval: Duration,
        timeout: Duration,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            registry,
            transport,
            interval,
            timeout,
            metrics,
        }
    }

    /// Probe on a fixed interval until shutdown. The first cycle runs at once.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval = ?self.interval,
            timeout = ?self.timeout,
            "health monitor starting"
        );

        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.check_all().await;
                    debug!(
                        healthy = summary.healthy,
                        unhealthy = summary.unhealthy,
                        "health check cycle complete"
                    );
                }

                _ = shutdown.recv() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// Probe every registered server concurrently.
    pub async fn check_all(&self) -> CheckSummary {
        let servers = self.registry.servers();
        let results = join_all(servers.iter().map(|s| self.check_server(s))).await;

        let healthy = results.iter().filter(|ok| **ok).count();
        CheckSummary {
            healthy,
            unhealthy: results.len() - healthy,
        }
    }

    /// Probe one server and record the result. Returns whether it is healthy.
    pub async fn check_server(&self, server: &Arc<Server>) -> bool {
        let descriptor = server.descriptor();
        let probe = Request::get(RequestId::short().into_string(), descriptor.health_check_path.clone())
            .with_header("user-agent", concat!("resilb/", env!("CARGO_PKG_VERSION")));

        let result = match tokio::time::timeout(
            self.timeout,
            self.transport.send(descriptor, &probe, self.timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(self.timeout)),
        };

        let healthy = match result {
            Ok(response) if response.is_success() => {
                apply_resource_usage(server, &response);
                true
            }
            Ok(response) => {
                warn!(server = %server.id(), status = response.status, "health check failed");
                false
            }
            Err(e) => {
                warn!(server = %server.id(), error = %e, "health check failed");
                false
            }
        };

        server.runtime().touch_health_check();
        if !self.registry.is_registered(server) {
            debug!(server = %server.id(), healthy, "probe result for deregistered server dropped");
            return healthy;
        }

        self.registry.update_health(server.id(), healthy);
        self.metrics.record_health_check(server.id(), healthy);
        self.metrics.set_backend_health(server.id(), healthy);

        healthy
    }
}

/// Store CPU/memory fractions if the probe reported both.
fn apply_resource_usage(server: &Server, response: &TransportResponse) {
    let parse = |name: &str| response.header(name).and_then(|v| v.trim().parse::<f64>().ok());

    if let (Some(cpu), Some(memory)) = (parse(CPU_USAGE_HEADER), parse(MEMORY_USAGE_HEADER)) {
        server.runtime().report_resource_usage(cpu, memory);
    }
}
