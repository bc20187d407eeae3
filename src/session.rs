//! Sticky session bindings.

use crate::util::Clock;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Binding {
    server_id: String,
    expires_at: Instant,
}

/// Maps session IDs to the server that first served them.
///
/// A binding lives for `duration` after it was last written. Expired
/// bindings are evicted when looked up and by the periodic sweeper.
#[derive(Debug)]
pub struct StickySessionManager {
    bindings: DashMap<String, Binding>,
    duration: Duration,
    clock: Arc<dyn Clock>,
}

impl StickySessionManager {
    pub fn new(duration: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            bindings: DashMap::new(),
            duration,
            clock,
        }
    }

    /// The bound server, if the binding has not expired.
    pub fn server_for_session(&self, session_id: &str) -> Option<String> {
        let now = self.clock.now();
        {
            let binding = self.bindings.get(session_id)?;
            if now < binding.expires_at {
                return Some(binding.server_id.clone());
            }
        }

        // Expired. Re-check under the write lock so a concurrent rebind survives.
        self.bindings
            .remove_if(session_id, |_, b| now >= b.expires_at);
        None
    }

    /// Bind a session to a server, replacing any existing binding.
    pub fn bind(&self, session_id: &str, server_id: &str) {
        let expires_at = self.clock.now() + self.duration;
        self.bindings.insert(
            session_id.to_string(),
            Binding {
                server_id: server_id.to_string(),
                expires_at,
            },
        );
    }

    /// Drop one binding.
    pub fn remove_session(&self, session_id: &str) -> bool {
        self.bindings.remove(session_id).is_some()
    }

    /// Drop every binding that points at a server. Returns how many went.
    pub fn remove_server(&self, server_id: &str) -> usize {
        let before = self.bindings.len();
        self.bindings.retain(|_, b| b.server_id != server_id);
        before.saturating_sub(self.bindings.len())
    }

    /// Evict expired bindings. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.bindings.len();
        self.bindings.retain(|_, b| now < b.expires_at);
        before.saturating_sub(self.bindings.len())
    }

    /// Number of stored bindings, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Sweep expired bindings every `interval` until shutdown.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, mut shutdown: broadcast::Receiver<()>) {
        info!(interval = ?interval, "session sweeper started");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately and there is nothing to sweep yet
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.sweep_expired();
                    if removed > 0 {
                        debug!(removed, remaining = self.len(), "swept expired sessions");
                    }
                }
                _ = shutdown.recv() => {
                    info!("session sweeper shutting down");
                    break;
                }
            }
        }
    }
}
