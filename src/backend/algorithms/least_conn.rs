//! Least-connections load balancing algorithms.

use super::{min_by_score, LoadBalancer};
use crate::backend::Server;
use crate::message::Request;
use std::sync::Arc;

/// Least-connections load balancer.
///
/// Sends requests to the server with the fewest active connections.
/// Ties go to the earliest candidate.
pub struct LeastConnections;

impl LeastConnections {
    /// Create a new least-connections load balancer.
    pub fn new() -> Self {
        Self
    }
}

impl Default for LeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for LeastConnections {
    fn name(&self) -> &'static str {
        "least_connections"
    }

    fn select(&self, _request: &Request, candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
        min_by_score(candidates, |s| s.runtime().active_connections() as f64)
    }
}

/// Least connections scaled by weight.
///
/// Picks the minimum of `active_connections / weight`, so a weight-3 server
/// carrying 3 requests ties with an idle-ish weight-1 server carrying 1.
pub struct WeightedLeastConnections;

impl WeightedLeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WeightedLeastConnections {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for WeightedLeastConnections {
    fn name(&self) -> &'static str {
        "weighted_least_connections"
    }

    fn select(&self, _request: &Request, candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
        min_by_score(candidates, |s| {
            s.runtime().active_connections() as f64 / s.weight() as f64
        })
    }
}
