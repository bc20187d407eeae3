//! resilb - a fault-tolerant HTTP load balancer
//!
//! This crate routes requests across a pool of upstream servers with:
//! - Pluggable load balancing algorithms
//! - Active health monitoring
//! - Per-server circuit breakers and retries with backoff
//! - Sticky sessions
//! - Prometheus metrics and an admin API

pub mod backend;
pub mod config;
pub mod frontend;
pub mod health;
pub mod message;
pub mod metrics;
pub mod session;
pub mod transport;
pub mod util;

pub use backend::{Router, RoutingError, ServerDescriptor};
pub use config::Config;
pub use message::{Request, Response};
