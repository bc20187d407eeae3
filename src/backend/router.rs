//! Request routing.
//!
//! The [`Router`] owns every piece of shared routing state: the server
//! registry, the selection algorithm, circuit breakers, sticky sessions and
//! metrics. Each request is matched to a server, dispatched through the
//! [`Transport`], and retried on other servers when the transport fails.

use crate::backend::algorithms::{build_load_balancer, LoadBalancer};
use crate::backend::registry::ServerRegistry;
use crate::backend::server::{RuntimeSnapshot, Server, ServerDescriptor};
use crate::config::BalancerConfig;
use crate::health::{CircuitBreakers, CircuitSnapshot, CircuitState, HealthMonitor};
use crate::message::{Request, Response};
use crate::metrics::{GlobalMetrics, MetricsCollector, UnroutedReason};
use crate::session::StickySessionManager;
use crate::transport::{Transport, TransportError};
use crate::util::{Clock, SystemClock};
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Upper bound for a single retry backoff, before jitter.
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Why a request could not be answered by a server.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RoutingError {
    #[error("no healthy server available")]
    NoHealthyServer,

    #[error("server not found: {0}")]
    ServerNotFound(String),

    #[error("request failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        attempts: u32,
        last_error: TransportError,
    },

    #[error("request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl RoutingError {
    /// Status code of the synthetic response sent to the client.
    pub fn status_code(&self) -> u16 {
        match self {
            RoutingError::DeadlineExceeded(_) => 504,
            RoutingError::ServerNotFound(_) => 404,
            RoutingError::NoHealthyServer | RoutingError::RetriesExhausted { .. } => 503,
        }
    }

    fn unrouted_reason(&self) -> Option<UnroutedReason> {
        match self {
            RoutingError::NoHealthyServer => Some(UnroutedReason::NoHealthyServer),
            RoutingError::RetriesExhausted { .. } => Some(UnroutedReason::RetriesExhausted),
            RoutingError::DeadlineExceeded(_) => Some(UnroutedReason::DeadlineExceeded),
            RoutingError::ServerNotFound(_) => None,
        }
    }
}

/// Everything known about one server.
#[derive(Debug, Clone, Serialize)]
pub struct ServerMetrics {
    pub config: ServerDescriptor,
    pub runtime: RuntimeSnapshot,
    pub circuit: CircuitSnapshot,
}

/// Routes requests to servers with retries, breakers and session affinity.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    config: BalancerConfig,
    registry: Arc<ServerRegistry>,
    strategy: Box<dyn LoadBalancer>,
    breakers: CircuitBreakers,
    sessions: Arc<StickySessionManager>,
    metrics: MetricsCollector,
    transport: Arc<dyn Transport>,
}

impl Router {
    /// Create a router using the system clock.
    pub fn new(config: BalancerConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    /// Create a router reading time from `clock` for breakers and sessions.
    pub fn with_clock(
        config: BalancerConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let strategy = build_load_balancer(config.algorithm, config.virtual_nodes);
        let breakers = CircuitBreakers::new(config.circuit_breaker.clone(), Arc::clone(&clock));
        let sessions = Arc::new(StickySessionManager::new(
            config.sticky_session_duration,
            clock,
        ));
        let metrics = MetricsCollector::new(config.response_window);

        info!(
            algorithm = strategy.name(),
            max_retries = config.max_retries,
            session_affinity = config.session_affinity,
            circuit_breaker = config.circuit_breaker.enabled,
            "router created"
        );

        Self {
            inner: Arc::new(RouterInner {
                config,
                registry: Arc::new(ServerRegistry::new()),
                strategy,
                breakers,
                sessions,
                metrics,
                transport,
            }),
        }
    }

    /// Router configuration.
    pub fn config(&self) -> &BalancerConfig {
        &self.inner.config
    }

    /// Name of the active selection algorithm.
    pub fn algorithm(&self) -> &'static str {
        self.inner.strategy.name()
    }

    /// The registered servers.
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.inner.registry
    }

    /// Per-server circuit breakers.
    pub fn breakers(&self) -> &CircuitBreakers {
        &self.inner.breakers
    }

    /// Sticky session bindings.
    pub fn sessions(&self) -> &Arc<StickySessionManager> {
        &self.inner.sessions
    }

    /// Metrics collector.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.inner.metrics
    }

    /// Register a server. Returns false if the ID is taken.
    ///
    /// The server is not routable until a health probe (or
    /// [`set_server_health`](Self::set_server_health)) marks it healthy.
    /// It always starts with a closed breaker, even if a server with the
    /// same ID was registered before.
    pub fn add_server(&self, descriptor: ServerDescriptor) -> bool {
        let id = descriptor.id.clone();
        if !self.inner.registry.add_server(descriptor) {
            return false;
        }

        self.inner.breakers.remove(&id);
        self.inner.metrics.set_backend_health(&id, false);
        self.inner
            .metrics
            .set_circuit_state(&id, CircuitState::Closed);
        self.inner.metrics.set_active_connections(&id, 0);
        true
    }

    /// Deregister a server along with its breaker and sticky bindings.
    ///
    /// Requests already dispatched to it run to completion.
    pub fn remove_server(&self, id: &str) -> bool {
        if !self.inner.registry.remove_server(id) {
            return false;
        }

        self.inner.breakers.remove(id);
        let unbound = self.inner.sessions.remove_server(id);
        self.inner.metrics.forget_server(id);
        debug!(server = id, sessions = unbound, "dropped server state");
        true
    }

    /// Set a server's health flag by hand. Returns whether it changed.
    pub fn set_server_health(&self, id: &str, healthy: bool) -> Result<bool, RoutingError> {
        let changed = self
            .inner
            .registry
            .update_health(id, healthy)
            .ok_or_else(|| RoutingError::ServerNotFound(id.to_string()))?;
        self.inner.metrics.set_backend_health(id, healthy);
        Ok(changed)
    }

    /// Metrics for every registered server, keyed by ID.
    pub fn server_metrics(&self) -> BTreeMap<String, ServerMetrics> {
        self.inner
            .registry
            .servers()
            .iter()
            .map(|s| (s.id().to_string(), self.inner.server_metrics(s)))
            .collect()
    }

    /// Metrics for one server.
    pub fn server_metrics_for(&self, id: &str) -> Result<ServerMetrics, RoutingError> {
        self.inner
            .registry
            .get(id)
            .map(|s| self.inner.server_metrics(&s))
            .ok_or_else(|| RoutingError::ServerNotFound(id.to_string()))
    }

    /// Aggregate request metrics.
    pub fn global_metrics(&self) -> GlobalMetrics {
        self.inner.metrics.global_metrics()
    }

    /// A health monitor probing this router's servers.
    pub fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.transport),
            self.inner.config.health_check_interval,
            self.inner.config.health_check_timeout,
            self.inner.metrics.clone(),
        )
    }

    /// Route a request, answering routing failures with a synthetic
    /// 503/504 response.
    pub async fn handle_request(&self, request: Request) -> Response {
        let request_id = request.id.clone();

        match self.route(request).await {
            Ok(response) => response,
            Err(e) => {
                if let Some(reason) = e.unrouted_reason() {
                    self.inner.metrics.record_unrouted(reason);
                }
                warn!(request_id = %request_id, error = %e, "request not routed");
                Response::synthetic(e.status_code(), e.to_string())
            }
        }
    }

    /// Route a request to a server, retrying on other servers when the
    /// transport fails.
    #[instrument(skip_all, fields(request_id = %request.id))]
    pub async fn route(&self, request: Request) -> Result<Response, RoutingError> {
        let request = Arc::new(request);

        match self.inner.config.request_deadline {
            Some(deadline) => {
                match tokio::time::timeout(deadline, self.route_with_retries(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(RoutingError::DeadlineExceeded(deadline)),
                }
            }
            None => self.route_with_retries(request).await,
        }
    }

    async fn route_with_retries(&self, request: Arc<Request>) -> Result<Response, RoutingError> {
        let inner = &self.inner;
        let max_attempts = inner.config.max_retries.saturating_add(1);
        let mut excluded: HashSet<String> = HashSet::new();
        let mut last_error: Option<TransportError> = None;
        let mut attempts = 0u32;

        loop {
            let Some(server) = inner.pick_server(&request, &excluded) else {
                return Err(match last_error {
                    Some(last_error) => RoutingError::RetriesExhausted {
                        attempts,
                        last_error,
                    },
                    None => RoutingError::NoHealthyServer,
                });
            };

            if attempts > 0 {
                inner.metrics.record_retry();
            }
            attempts += 1;

            match RouterInner::dispatch(Arc::clone(inner), Arc::clone(&server), Arc::clone(&request))
                .await
            {
                Ok(response) => return Ok(response),
                Err(e) => {
                    debug!(
                        server = %server.id(),
                        attempt = attempts,
                        error = %e,
                        "attempt failed"
                    );
                    excluded.insert(server.id().to_string());

                    if attempts >= max_attempts {
                        return Err(RoutingError::RetriesExhausted {
                            attempts,
                            last_error: e,
                        });
                    }
                    last_error = Some(e);

                    let delay = backoff_delay(inner.config.retry_backoff, attempts);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

impl RouterInner {
    fn server_metrics(&self, server: &Server) -> ServerMetrics {
        ServerMetrics {
            config: server.descriptor().clone(),
            runtime: server.runtime().snapshot(),
            circuit: self.breakers.snapshot(server.id()),
        }
    }

    /// Choose the server for the next attempt.
    fn pick_server(&self, request: &Request, excluded: &HashSet<String>) -> Option<Arc<Server>> {
        let session = if self.config.session_affinity {
            request.session_id.as_deref()
        } else {
            None
        };

        if let Some(session_id) = session {
            if let Some(server) = self.sticky_server(session_id, excluded) {
                // Refresh so active sessions do not expire mid-use
                self.sessions.bind(session_id, server.id());
                debug!(session = session_id, server = %server.id(), "sticky session hit");
                return Some(server);
            }
        }

        let candidates: Vec<Arc<Server>> = self
            .registry
            .healthy_servers()
            .into_iter()
            .filter(|s| !excluded.contains(s.id()))
            .filter(|s| s.has_capacity())
            .filter(|s| self.breaker_allows(s.id()))
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let server = self.strategy.select(request, &candidates)?;
        if let Some(session_id) = session {
            self.sessions.bind(session_id, server.id());
        }
        Some(server)
    }

    /// Breaker check that also publishes a lazy open to half-open move.
    fn breaker_allows(&self, server_id: &str) -> bool {
        let (allowed, transition) = self.breakers.admit(server_id);
        if let Some(state) = transition {
            self.metrics.set_circuit_state(server_id, state);
        }
        allowed
    }

    /// The session's bound server, if it can still take the request.
    fn sticky_server(&self, session_id: &str, excluded: &HashSet<String>) -> Option<Arc<Server>> {
        let server_id = self.sessions.server_for_session(session_id)?;
        if excluded.contains(&server_id) {
            return None;
        }

        let server = self.registry.get(&server_id)?;
        let usable = server.is_healthy()
            && server.has_capacity()
            && self.breaker_allows(&server_id);
        usable.then_some(server)
    }

    /// Send one attempt to `server`.
    ///
    /// The attempt runs in its own task holding the connection guard and
    /// records its outcome even if the caller stops waiting for it.
    async fn dispatch(
        inner: Arc<RouterInner>,
        server: Arc<Server>,
        request: Arc<Request>,
    ) -> Result<Response, TransportError> {
        let guard = server.acquire();
        inner
            .metrics
            .set_active_connections(server.id(), server.runtime().active_connections());

        let task = tokio::spawn(async move {
            let server = Arc::clone(guard.server());
            let timeout = server.descriptor().request_timeout;
            let started = Instant::now();

            let result = match tokio::time::timeout(
                timeout,
                inner.transport.send(server.descriptor(), &request, timeout),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(timeout)),
            };
            let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;

            let result = match result {
                Ok(response) if inner.config.retry_on_server_error && response.status >= 500 => {
                    Err(TransportError::ServerError {
                        status: response.status,
                    })
                }
                other => other,
            };

            let success = result.is_ok();
            inner
                .metrics
                .record_request(&server, response_time_ms, success);
            drop(guard);

            // A server deregistered mid-flight keeps no breaker or gauges
            if inner.registry.is_registered(&server) {
                if success {
                    inner.breakers.record_success(server.id());
                } else {
                    inner.breakers.record_failure(server.id());
                }
                inner
                    .metrics
                    .set_circuit_state(server.id(), inner.breakers.state(server.id()));
                inner
                    .metrics
                    .set_active_connections(server.id(), server.runtime().active_connections());
            } else {
                debug!(server = %server.id(), success, "outcome for deregistered server");
            }

            result.map(|response| Response {
                status_code: response.status,
                headers: response.headers,
                body: response.body,
                response_time_ms,
                server_id: Some(server.id().to_string()),
            })
        });

        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(error = %e, "dispatch task failed");
                Err(TransportError::Aborted)
            }
        }
    }
}

/// Delay before retry number `retry` (1-based): exponential from `base`,
/// capped, plus up to 25% jitter. Zero when `base` is zero.
fn backoff_delay(base: Duration, retry: u32) -> Duration {
    if base.is_zero() {
        return Duration::ZERO;
    }

    let exponent = retry.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exponent).min(MAX_BACKOFF);

    let jitter_ms = delay.as_millis() as u64 / 4;
    if jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}
