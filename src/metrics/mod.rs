//! Metrics collection and exposition.

mod collector;
mod server;

pub use collector::{GlobalMetrics, MetricsCollector, UnroutedReason};
pub use server::MetricsServer;
