//! Resource-aware selection.

use super::{min_by_score, LoadBalancer};
use crate::backend::Server;
use crate::message::Request;
use std::sync::Arc;

const CPU_WEIGHT: f64 = 0.4;
const MEMORY_WEIGHT: f64 = 0.3;
const CONNECTION_WEIGHT: f64 = 0.3;

/// Picks the server with the lowest combined load score.
///
/// The score blends the CPU and memory fractions reported by health probes
/// with the share of the connection limit in use.
pub struct ResourceBased;

impl ResourceBased {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ResourceBased {
    fn default() -> Self {
        Self::new()
    }
}

/// Load score in [0, 1]; lower is better.
pub(crate) fn load_score(server: &Server) -> f64 {
    let runtime = server.runtime();
    CPU_WEIGHT * runtime.cpu_usage()
        + MEMORY_WEIGHT * runtime.memory_usage()
        + CONNECTION_WEIGHT * server.load_fraction()
}

impl LoadBalancer for ResourceBased {
    fn name(&self) -> &'static str {
        "resource_based"
    }

    fn select(&self, _request: &Request, candidates: &[Arc<Server>]) -> Option<Arc<Server>> {
        min_by_score(candidates, load_score)
    }
}
