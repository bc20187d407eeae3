//! Configuration data types.

use crate::backend::ServerDescriptor;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub global: GlobalConfig,

    /// Client-facing listener
    #[serde(default)]
    pub frontend: FrontendConfig,

    /// Routing, retry, health and breaker settings
    #[serde(default)]
    pub balancer: BalancerConfig,

    /// Upstream servers registered at startup
    #[serde(default)]
    pub servers: Vec<ServerDescriptor>,
}

/// Global configuration settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GlobalConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log format: json, pretty or compact
    #[serde(default)]
    pub log_format: LogFormat,

    /// Metrics and admin endpoint configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

/// Metrics endpoint configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Whether the metrics/admin endpoint is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address to bind the metrics server
    #[serde(default = "default_metrics_address")]
    pub address: SocketAddr,

    /// Path for the Prometheus endpoint
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
            path: default_metrics_path(),
        }
    }
}

/// Client-facing HTTP listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FrontendConfig {
    /// Address and port to listen on
    #[serde(default = "default_listen_address")]
    pub listen: SocketAddr,

    /// Header carrying the client session ID
    #[serde(default = "default_session_header")]
    pub session_header: String,

    /// Cookie carrying the client session ID (checked after the header)
    #[serde(default = "default_session_cookie")]
    pub session_cookie: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_address(),
            session_header: default_session_header(),
            session_cookie: default_session_cookie(),
        }
    }
}

/// Load balancing algorithm.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    #[default]
    RoundRobin,
    WeightedRoundRobin,
    LeastConnections,
    WeightedLeastConnections,
    ConsistentHash,
    Random,
    ResourceBased,
}

/// Router configuration, fixed once the router is built.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    /// Server selection algorithm
    #[serde(default)]
    pub algorithm: Algorithm,

    /// How often every server is probed
    #[serde(default = "default_health_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,

    /// Probe timeout, strictly shorter than the interval
    #[serde(default = "default_health_timeout", with = "humantime_serde")]
    pub health_check_timeout: Duration,

    /// Retries after the first failed attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between attempts, doubled per retry
    #[serde(default = "default_retry_backoff", with = "humantime_serde")]
    pub retry_backoff: Duration,

    /// Pin sessions to the server that first handled them
    #[serde(default)]
    pub session_affinity: bool,

    /// Lifetime of a sticky binding
    #[serde(default = "default_sticky_duration", with = "humantime_serde")]
    pub sticky_session_duration: Duration,

    /// How often expired sticky bindings are swept
    #[serde(default = "default_session_sweep_interval", with = "humantime_serde")]
    pub session_sweep_interval: Duration,

    /// Ring points per server for consistent hashing
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,

    /// Number of recent response times kept for percentiles
    #[serde(default = "default_response_window")]
    pub response_window: usize,

    /// Treat upstream 5xx responses as transport failures
    #[serde(default)]
    pub retry_on_server_error: bool,

    /// Overall budget for one request, retries included
    #[serde(default, with = "option_humantime_serde")]
    pub request_deadline: Option<Duration>,

    /// Per-server circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            health_check_interval: default_health_interval(),
            health_check_timeout: default_health_timeout(),
            max_retries: default_max_retries(),
            retry_backoff: default_retry_backoff(),
            session_affinity: false,
            sticky_session_duration: default_sticky_duration(),
            session_sweep_interval: default_session_sweep_interval(),
            virtual_nodes: default_virtual_nodes(),
            response_window: default_response_window(),
            retry_on_server_error: false,
            request_deadline: None,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

/// Circuit breaker settings shared by every server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    /// When false, breakers never block and record nothing
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive failures that open the breaker
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,

    /// Time an open breaker waits before allowing a probe request
    #[serde(default = "default_breaker_timeout", with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold: default_breaker_threshold(),
            timeout: default_breaker_timeout(),
        }
    }
}

/// Transport protocol spoken to an upstream server.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl Protocol {
    /// URL scheme for this protocol.
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_metrics_address() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

fn default_listen_address() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_session_header() -> String {
    "x-session-id".to_string()
}

fn default_session_cookie() -> String {
    "session_id".to_string()
}

fn default_health_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff() -> Duration {
    Duration::from_millis(100)
}

fn default_sticky_duration() -> Duration {
    Duration::from_secs(3600)
}

fn default_session_sweep_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_virtual_nodes() -> u32 {
    150
}

fn default_response_window() -> usize {
    1000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Serde adapter for humantime durations.
pub(crate) mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// Serde adapter for optional humantime durations.
pub(crate) mod option_humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => {
                let s = humantime::format_duration(*d).to_string();
                serializer.serialize_some(&s)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<String> = Option::deserialize(deserializer)?;
        opt.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
