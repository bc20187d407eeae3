//! Server health: active probing and per-server circuit breakers.

mod circuit_breaker;
mod monitor;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakers, CircuitSnapshot, CircuitState};
pub use monitor::{CheckSummary, HealthMonitor, CPU_USAGE_HEADER, MEMORY_USAGE_HEADER};
