//! Load balancing algorithms.

mod consistent_hash;
mod least_conn;
mod random;
mod resource;
mod round_robin;
mod weighted;

pub use consistent_hash::ConsistentHash;
pub use least_conn::{LeastConnections, WeightedLeastConnections};
pub use random::Random;
pub use resource::ResourceBased;
pub use round_robin::RoundRobin;
pub use weighted::WeightedRoundRobin;

use crate::backend::Server;
use crate::config::Algorithm;
use crate::message::Request;
use std::sync::Arc;

/// Trait for load balancing algorithms.
pub trait LoadBalancer: Send + Sync {
    /// Algorithm name for logs.
    fn name(&self) -> &'static str;

    /// Select a server for the request.
    ///
    /// # Arguments
    ///
    /// * `request` - The request being routed (hash-based algorithms read its affinity key)
    /// * `candidates` - Servers that passed health, capacity and breaker filtering,
    ///   in registration order
    ///
    /// # Returns
    ///
    /// The selected server, or None if there are no candidates.
    fn select(&self, request: &Request, candidates: &[Arc<Server>]) -> Option<Arc<Server>>;
}

/// Build the load balancer for an algorithm.
pub fn build_load_balancer(algorithm: Algorithm, virtual_nodes: u32) -> Box<dyn LoadBalancer> {
    match algorithm {
        Algorithm::RoundRobin => Box::new(RoundRobin::new()),
        Algorithm::WeightedRoundRobin => Box::new(WeightedRoundRobin::new()),
        Algorithm::LeastConnections => Box::new(LeastConnections::new()),
        Algorithm::WeightedLeastConnections => Box::new(WeightedLeastConnections::new()),
        Algorithm::ConsistentHash => Box::new(ConsistentHash::new(virtual_nodes)),
        Algorithm::Random => Box::new(Random::new()),
        Algorithm::ResourceBased => Box::new(ResourceBased::new()),
    }
}

/// Sorted IDs of a candidate set.
///
/// Derived caches are rebuilt when this changes, so swapping one server for
/// another invalidates them even though the count stays the same.
pub(crate) fn candidate_signature(candidates: &[Arc<Server>]) -> Vec<String> {
    let mut ids: Vec<String> = candidates.iter().map(|s| s.id().to_string()).collect();
    ids.sort_unstable();
    ids
}

/// Whether a cached signature still describes the candidates.
pub(crate) fn signature_matches(cached: &[String], candidates: &[Arc<Server>]) -> bool {
    if cached.len() != candidates.len() {
        return false;
    }
    let mut ids: Vec<&str> = candidates.iter().map(|s| s.id()).collect();
    ids.sort_unstable();
    ids.iter().zip(cached).all(|(a, b)| *a == b.as_str())
}

/// Resolve a cached server ID against the live candidates.
pub(crate) fn find_candidate(candidates: &[Arc<Server>], id: &str) -> Option<Arc<Server>> {
    candidates.iter().find(|s| s.id() == id).cloned()
}

/// First candidate with the lowest score; ties keep input order.
pub(crate) fn min_by_score<F>(candidates: &[Arc<Server>], score: F) -> Option<Arc<Server>>
where
    F: Fn(&Server) -> f64,
{
    let mut best: Option<(&Arc<Server>, f64)> = None;

    for server in candidates {
        let value = score(server);
        match best {
            Some((_, best_value)) if value >= best_value => {}
            _ => best = Some((server, value)),
        }
    }

    best.map(|(server, _)| Arc::clone(server))
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::backend::{Server, ServerDescriptor};
    use std::sync::Arc;

    /// Servers `s1..=sN` with the given weights.
    pub fn weighted_servers(weights: &[u32]) -> Vec<Arc<Server>> {
        weights
            .iter()
            .enumerate()
            .map(|(i, w)| {
                Arc::new(Server::new(
                    ServerDescriptor::new(format!("s{}", i + 1), "127.0.0.1", 9001 + i as u16)
                        .with_weight(*w),
                ))
            })
            .collect()
    }

    /// `n` servers of weight 1.
    pub fn servers(n: usize) -> Vec<Arc<Server>> {
        weighted_servers(&vec![1; n])
    }
}
