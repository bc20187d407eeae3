//! Consistent hashing load balancing algorithm.

use super::{candidate_signature, find_candidate, signature_matches, LoadBalancer};
use crate::backend::Server;
use crate::message::Request;
use fnv::FnvHasher;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::hash::Hasher;
use std::sync::Arc;
use tracing::debug;

/// Consistent hash load balancer.
///
/// Each candidate is placed on a hash ring `virtual_nodes` times. A request
/// maps to the first ring point at or after the hash of its affinity key
/// (session ID, or client IP without one), wrapping around at the end.
/// Adding or removing a server only moves the keys adjacent to its points.
pub struct ConsistentHash {
    virtual_nodes: u32,
    ring: Mutex<Ring>,
}

#[derive(Default)]
struct Ring {
    signature: Vec<String>,
    points: BTreeMap<u64, String>,
}

impl Ring {
    fn rebuild(&mut self, candidates: &[Arc<Server>], virtual_nodes: u32) {
        self.points.clear();
        for server in candidates {
            for replica in 0..virtual_nodes {
                let key = format!("{}:{}", server.id(), replica);
                self.points.insert(hash_key(key.as_bytes()), server.id().to_string());
            }
        }
        self.signature = candidate_signature(candidates);
    }

    fn lookup(&self, hash: u64) -> Option<&str> {
        self.points
            .range(hash..)
            .next()
            .or_else(|| self.points.iter().next())
            .map(|(_, id)| id.as_str())
    }
}

impl ConsistentHash {
    /// Create a ring with `virtual_nodes` points per server.
    pub fn new(virtual_nodes: u32) -> Self {
        Self {
            virtual_nodes: virtual_nodes.max(1),
            ring: Mutex::new(Ring::default()),
        }
    }
}

impl LoadBalancer for ConsistentHash {
    fn name(&self) -> &'static str {
        "consistent_hash"
    }

    fn select(&self, request: &Request, candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
        if candidates.is_empty() {
            return None;
        }

        let hash = hash_key(request.affinity_key().as_bytes());
        let id = {
            let mut ring = self.ring.lock();
            if !signature_matches(&ring.signature, candidates) {
                ring.rebuild(candidates, self.virtual_nodes);
                debug!(points = ring.points.len(), "rebuilt hash ring");
            }
            ring.lookup(hash)?.to_string()
        };

        find_candidate(candidates, &id)
    }
}

/// FNV-1a 64 with an avalanche finalizer.
///
/// Raw FNV clusters on short keys that differ only in the last bytes
/// (`s1:0`, `s1:1`, ...), which skews the ring.
pub(crate) fn hash_key(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    mix64(hasher.finish())
}

fn mix64(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51_afd7_ed55_8ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    h ^= h >> 33;
    h
}
