//! Server pool, load balancing algorithms and request routing.

pub mod algorithms;
mod registry;
mod router;
mod server;

pub use registry::ServerRegistry;
pub use router::{Router, RoutingError, ServerMetrics};
pub use server::{ConnectionGuard, Health, RuntimeSnapshot, Server, ServerDescriptor, ServerRuntime};
