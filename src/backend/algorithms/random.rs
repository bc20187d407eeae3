//! Uniform random selection.

use super::LoadBalancer;
use crate::backend::Server;
use crate::message::Request;
use rand::Rng;
use std::sync::Arc;

/// Picks a candidate uniformly at random.
pub struct Random;

impl Random {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer for Random {
    fn name(&self) -> &'static str {
        "random"
    }

    fn select(&self, _request: &Request, candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
        if candidates.is_empty() {
            return None;
        }

        let idx = rand::rng().random_range(0..candidates.len());
        Some(Arc::clone(&candidates[idx]))
    }
}
