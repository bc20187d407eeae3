//! Upstream server descriptors and their runtime state.

use crate::config::{humantime_serde, Protocol};
use crate::util::unix_millis;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Smoothing factor for the response time moving average.
const EMA_ALPHA: f64 = 0.1;

/// Static description of an upstream server.
///
/// Immutable once registered.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ServerDescriptor {
    /// Unique identifier
    pub id: String,

    /// Hostname or IP address
    pub host: String,

    /// Port
    pub port: u16,

    /// Relative share for weighted algorithms (>= 1)
    #[serde(default = "default_weight")]
    pub weight: u32,

    /// Concurrent requests allowed before the server is skipped
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Path probed by the health monitor
    #[serde(default = "default_health_check_path")]
    pub health_check_path: String,

    /// Per-attempt timeout for proxied requests
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Protocol spoken to the server
    #[serde(default)]
    pub protocol: Protocol,

    /// Free-form locality label
    #[serde(default = "default_region")]
    pub region: String,
}

impl ServerDescriptor {
    /// Descriptor with default weight, limits and timeouts.
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            weight: default_weight(),
            max_connections: default_max_connections(),
            health_check_path: default_health_check_path(),
            request_timeout: default_request_timeout(),
            protocol: Protocol::default(),
            region: default_region(),
        }
    }

    /// Set the weight.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }

    /// Set the connection limit.
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Base URL, e.g. `http://10.0.0.1:8080`.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol.scheme(), self.authority())
    }
}

fn default_weight() -> u32 {
    1
}

fn default_max_connections() -> u32 {
    100
}

fn default_health_check_path() -> String {
    "/health".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_region() -> String {
    "default".to_string()
}

/// Health as last observed by the health monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    /// Not probed yet
    Unknown,
    Healthy,
    Unhealthy,
}

impl Health {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Health::Healthy,
            2 => Health::Unhealthy,
            _ => Health::Unknown,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Health::Unknown => 0,
            Health::Healthy => 1,
            Health::Unhealthy => 2,
        }
    }
}

/// Mutable per-server counters.
#[derive(Debug)]
pub struct ServerRuntime {
    active_connections: AtomicU32,
    total_requests: AtomicU64,
    success_count: AtomicU64,
    failure_count: AtomicU64,
    /// f64 bits
    avg_response_time_ms: AtomicU64,
    health: AtomicU8,
    /// Unix millis, 0 until the first probe
    last_health_check: AtomicU64,
    /// f64 bits, fraction in [0, 1]
    cpu_usage: AtomicU64,
    /// f64 bits, fraction in [0, 1]
    memory_usage: AtomicU64,
}

impl Default for ServerRuntime {
    fn default() -> Self {
        Self {
            active_connections: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            failure_count: AtomicU64::new(0),
            avg_response_time_ms: AtomicU64::new(0f64.to_bits()),
            health: AtomicU8::new(Health::Unknown.as_u8()),
            last_health_check: AtomicU64::new(0),
            cpu_usage: AtomicU64::new(0f64.to_bits()),
            memory_usage: AtomicU64::new(0f64.to_bits()),
        }
    }
}

impl ServerRuntime {
    /// Requests currently in flight.
    pub fn active_connections(&self) -> u32 {
        self.active_connections.load(Ordering::Acquire)
    }

    /// Current health.
    pub fn health(&self) -> Health {
        Health::from_u8(self.health.load(Ordering::Acquire))
    }

    /// Store a new health value, returning whether it changed.
    pub(crate) fn set_health(&self, health: Health) -> bool {
        self.health.swap(health.as_u8(), Ordering::AcqRel) != health.as_u8()
    }

    /// Stamp the time of the latest probe.
    pub(crate) fn touch_health_check(&self) {
        self.last_health_check
            .store(unix_millis(), Ordering::Release);
    }

    /// Smoothed response time in milliseconds (0 before any request).
    pub fn avg_response_time_ms(&self) -> f64 {
        f64::from_bits(self.avg_response_time_ms.load(Ordering::Acquire))
    }

    /// Reported CPU usage fraction.
    pub fn cpu_usage(&self) -> f64 {
        f64::from_bits(self.cpu_usage.load(Ordering::Relaxed))
    }

    /// Reported memory usage fraction.
    pub fn memory_usage(&self) -> f64 {
        f64::from_bits(self.memory_usage.load(Ordering::Relaxed))
    }

    /// Record resource usage reported by the server, clamped to [0, 1].
    pub fn report_resource_usage(&self, cpu: f64, memory: f64) {
        self.cpu_usage
            .store(clamp_fraction(cpu).to_bits(), Ordering::Relaxed);
        self.memory_usage
            .store(clamp_fraction(memory).to_bits(), Ordering::Relaxed);
    }

    /// Count a finished request and fold its latency into the moving average.
    pub(crate) fn record_outcome(&self, response_time_ms: f64, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_count.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failure_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut current = self.avg_response_time_ms.load(Ordering::Acquire);
        loop {
            let avg = f64::from_bits(current);
            let next = if avg == 0.0 {
                response_time_ms
            } else {
                (1.0 - EMA_ALPHA) * avg + EMA_ALPHA * response_time_ms
            };

            match self.avg_response_time_ms.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn increment_connections(&self) {
        self.active_connections.fetch_add(1, Ordering::AcqRel);
    }

    fn decrement_connections(&self) {
        // Saturating so a stray decrement can never wrap below zero.
        let _ = self.active_connections.fetch_update(
            Ordering::AcqRel,
            Ordering::Acquire,
            |current| current.checked_sub(1),
        );
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> RuntimeSnapshot {
        let last_check = self.last_health_check.load(Ordering::Acquire);
        RuntimeSnapshot {
            active_connections: self.active_connections(),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            success_count: self.success_count.load(Ordering::Relaxed),
            failure_count: self.failure_count.load(Ordering::Relaxed),
            avg_response_time_ms: self.avg_response_time_ms(),
            health: self.health(),
            last_health_check: (last_check != 0).then_some(last_check),
            cpu_usage: self.cpu_usage(),
            memory_usage: self.memory_usage(),
        }
    }
}

fn clamp_fraction(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Serializable copy of [`ServerRuntime`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuntimeSnapshot {
    pub active_connections: u32,
    pub total_requests: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_response_time_ms: f64,
    pub health: Health,
    /// Unix millis of the latest probe
    pub last_health_check: Option<u64>,
    pub cpu_usage: f64,
    pub memory_usage: f64,
}

/// A registered server: descriptor plus runtime state.
#[derive(Debug)]
pub struct Server {
    descriptor: ServerDescriptor,
    runtime: ServerRuntime,
}

impl Server {
    /// Wrap a descriptor with fresh runtime state (health unknown).
    pub fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            descriptor,
            runtime: ServerRuntime::default(),
        }
    }

    /// Server ID.
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Static configuration.
    pub fn descriptor(&self) -> &ServerDescriptor {
        &self.descriptor
    }

    /// Runtime counters.
    pub fn runtime(&self) -> &ServerRuntime {
        &self.runtime
    }

    /// Weight, never below 1.
    pub fn weight(&self) -> u32 {
        self.descriptor.weight.max(1)
    }

    /// Whether the last probe succeeded.
    pub fn is_healthy(&self) -> bool {
        self.runtime.health() == Health::Healthy
    }

    /// Whether another request fits under `max_connections`.
    pub fn has_capacity(&self) -> bool {
        self.runtime.active_connections() < self.descriptor.max_connections
    }

    /// Fraction of the connection limit in use.
    pub fn load_fraction(&self) -> f64 {
        let max = self.descriptor.max_connections.max(1) as f64;
        self.runtime.active_connections() as f64 / max
    }

    /// Count a request as in flight until the returned guard drops.
    pub fn acquire(self: &Arc<Self>) -> ConnectionGuard {
        self.runtime.increment_connections();
        ConnectionGuard {
            server: Arc::clone(self),
        }
    }
}

/// Holds one active connection slot; releases it exactly once on drop.
#[derive(Debug)]
pub struct ConnectionGuard {
    server: Arc<Server>,
}

impl ConnectionGuard {
    /// The server this slot belongs to.
    pub fn server(&self) -> &Arc<Server> {
        &self.server
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.server.runtime.decrement_connections();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Arc<Server> {
        Arc::new(Server::new(ServerDescriptor::new("s1", "127.0.0.1", 9001)))
    }

    #[test]
    fn test_new_server_health_unknown() {
        let s = server();
        assert_eq!(s.runtime().health(), Health::Unknown);
        assert!(!s.is_healthy());
        assert!(s.runtime().snapshot().last_health_check.is_none());
    }

    #[test]
    fn test_set_health_reports_change() {
        let s = server();
        assert!(s.runtime().set_health(Health::Healthy));
        assert!(!s.runtime().set_health(Health::Healthy));
        assert!(s.runtime().set_health(Health::Unhealthy));
        assert!(!s.is_healthy());
    }

    #[test]
    fn test_connection_guard_releases_once() {
        let s = server();
        let a = s.acquire();
        let b = s.acquire();
        assert_eq!(s.runtime().active_connections(), 2);

        drop(a);
        assert_eq!(s.runtime().active_connections(), 1);
        drop(b);
        assert_eq!(s.runtime().active_connections(), 0);

        // Should not go negative
        s.runtime().decrement_connections();
        assert_eq!(s.runtime().active_connections(), 0);
    }

    #[test]
    fn test_capacity() {
        let s = Arc::new(Server::new(
            ServerDescriptor::new("s1", "127.0.0.1", 9001).with_max_connections(2),
        ));
        let _a = s.acquire();
        assert!(s.has_capacity());
        let _b = s.acquire();
        assert!(!s.has_capacity());
        assert!((s.load_fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_ema_first_sample_then_smoothing() {
        let s = server();
        s.runtime().record_outcome(100.0, true);
        assert!((s.runtime().avg_response_time_ms() - 100.0).abs() < 1e-9);

        s.runtime().record_outcome(200.0, false);
        // 0.9 * 100 + 0.1 * 200
        assert!((s.runtime().avg_response_time_ms() - 110.0).abs() < 1e-9);

        let snap = s.runtime().snapshot();
        assert_eq!(snap.total_requests, 2);
        assert_eq!(snap.success_count, 1);
        assert_eq!(snap.failure_count, 1);
    }

    #[test]
    fn test_resource_usage_clamped() {
        let s = server();
        s.runtime().report_resource_usage(1.7, -0.2);
        assert_eq!(s.runtime().cpu_usage(), 1.0);
        assert_eq!(s.runtime().memory_usage(), 0.0);
    }

    #[test]
    fn test_descriptor_urls() {
        let d = ServerDescriptor::new("s1", "10.0.0.1", 8080);
        assert_eq!(d.authority(), "10.0.0.1:8080");
        assert_eq!(d.base_url(), "http://10.0.0.1:8080");
    }
}
