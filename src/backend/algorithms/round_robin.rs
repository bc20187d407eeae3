//! Round-robin load balancing algorithm.

use super::LoadBalancer;
use crate::backend::Server;
use crate::message::Request;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Round-robin load balancer.
///
/// Distributes requests evenly across all candidates in order. Fairness
/// relies on candidates arriving in a stable order between calls.
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    /// Create a new round-robin load balancer.
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for RoundRobin {
    fn name(&self) -> &'static str {
        "round_robin"
    }

    fn select(&self, _request: &Request, candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
        if candidates.is_empty() {
            return None;
        }

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(Arc::clone(&candidates[idx]))
    }
}
