//! Weighted round-robin load balancing algorithm.

use super::{candidate_signature, find_candidate, signature_matches, LoadBalancer};
use crate::backend::Server;
use crate::message::Request;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Weighted round-robin load balancer.
///
/// Each server owns `weight` slots in a cycle. Slots are interleaved (one
/// per server per round while it has weight left) so heavy servers are not
/// hit in bursts. The slot list is rebuilt only when the candidate set changes.
pub struct WeightedRoundRobin {
    slots: Mutex<SlotCache>,
    cursor: AtomicUsize,
}

#[derive(Default)]
struct SlotCache {
    signature: Vec<String>,
    slots: Vec<String>,
}

impl WeightedRoundRobin {
    /// Create a new weighted round-robin load balancer.
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(SlotCache::default()),
            cursor: AtomicUsize::new(0),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

/// Interleaved slot list for the candidates.
fn build_slots(candidates: &[Arc<Server>]) -> Vec<String> {
    let max_weight = candidates.iter().map(|s| s.weight()).max().unwrap_or(0);
    let total: usize = candidates.iter().map(|s| s.weight() as usize).sum();

    let mut slots = Vec::with_capacity(total);
    for round in 0..max_weight {
        for server in candidates {
            if server.weight() > round {
                slots.push(server.id().to_string());
            }
        }
    }
    slots
}

impl LoadBalancer for WeightedRoundRobin {
    fn name(&self) -> &'static str {
        "weighted_round_robin"
    }

    fn select(&self, _request: &Request, candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
        if candidates.is_empty() {
            return None;
        }

        let id = {
            let mut cache = self.slots.lock();
            if !signature_matches(&cache.signature, candidates) {
                cache.signature = candidate_signature(candidates);
                cache.slots = build_slots(candidates);
                self.cursor.store(0, Ordering::Relaxed);
                debug!(slots = cache.slots.len(), "rebuilt weighted slot list");
            }

            let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % cache.slots.len();
            cache.slots[idx].clone()
        };

        find_candidate(candidates, &id)
    }
}
