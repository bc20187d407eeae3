//! Per-server circuit breakers.
//!
//! A breaker tracks request outcomes for one server, independently of its
//! probed health. After `threshold` consecutive failures it opens and the
//! server is skipped; once `timeout` has passed since the last failure the
//! next admission check moves it to half-open and lets traffic through
//! again. A success closes it, a failure reopens it.

use crate::config::CircuitBreakerConfig;
use crate::util::Clock;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Numeric encoding for gauges: 0 closed, 1 half-open, 2 open.
    pub fn as_gauge(self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// State for a single server.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    last_success: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            last_success: None,
        }
    }
}

impl CircuitBreaker {
    /// Current state.
    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a request may be sent, moving open to half-open once the
    /// timeout has elapsed.
    fn admit(&mut self, config: &CircuitBreakerConfig, now: Instant) -> (bool, Option<CircuitState>) {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => (true, None),
            CircuitState::Open => {
                let elapsed = self
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or_default();
                if elapsed > config.timeout {
                    self.state = CircuitState::HalfOpen;
                    (true, Some(CircuitState::HalfOpen))
                } else {
                    (false, None)
                }
            }
        }
    }

    fn on_success(&mut self, now: Instant) -> Option<CircuitState> {
        self.consecutive_failures = 0;
        self.last_success = Some(now);
        if self.state == CircuitState::HalfOpen {
            self.state = CircuitState::Closed;
            return Some(CircuitState::Closed);
        }
        None
    }

    fn on_failure(&mut self, config: &CircuitBreakerConfig, now: Instant) -> Option<CircuitState> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);

        let should_open = match self.state {
            CircuitState::Closed => self.consecutive_failures >= config.threshold,
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if should_open {
            self.state = CircuitState::Open;
            return Some(CircuitState::Open);
        }
        None
    }

    fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        let ago = |t: Option<Instant>| t.map(|t| now.saturating_duration_since(t).as_millis() as u64);
        CircuitSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            last_failure_ms_ago: ago(self.last_failure),
            last_success_ms_ago: ago(self.last_success),
        }
    }
}

/// Serializable view of a breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_failure_ms_ago: Option<u64>,
    pub last_success_ms_ago: Option<u64>,
}

impl Default for CircuitSnapshot {
    fn default() -> Self {
        CircuitBreaker::default().snapshot(Instant::now())
    }
}

/// Breakers for every server, created on first use.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: DashMap<String, CircuitBreaker>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            clock,
        }
    }

    /// Whether breakers are enforced.
    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Whether the server may receive a request.
    ///
    /// Always true when breakers are disabled. An open breaker whose timeout
    /// has elapsed is moved to half-open here.
    pub fn can_execute(&self, server_id: &str) -> bool {
        self.admit(server_id).0
    }

    /// [`can_execute`](Self::can_execute), also returning the new state when
    /// the check moved an open breaker to half-open.
    pub fn admit(&self, server_id: &str) -> (bool, Option<CircuitState>) {
        if !self.config.enabled {
            return (true, None);
        }

        let now = self.clock.now();
        let mut breaker = self.breakers.entry(server_id.to_string()).or_default();
        let (allowed, transition) = breaker.admit(&self.config, now);
        drop(breaker);

        if let Some(state) = transition {
            info!(server = server_id, state = %state, "circuit breaker transition");
        }
        (allowed, transition)
    }

    /// Record a successful request. Returns the new state on a transition.
    pub fn record_success(&self, server_id: &str) -> Option<CircuitState> {
        if !self.config.enabled {
            return None;
        }

        let now = self.clock.now();
        let transition = self
            .breakers
            .entry(server_id.to_string())
            .or_default()
            .on_success(now);

        if let Some(state) = transition {
            info!(server = server_id, state = %state, "circuit breaker transition");
        }
        transition
    }

    /// Record a failed request. Returns the new state on a transition.
    pub fn record_failure(&self, server_id: &str) -> Option<CircuitState> {
        if !self.config.enabled {
            return None;
        }

        let now = self.clock.now();
        let (transition, failures) = {
            let mut breaker = self.breakers.entry(server_id.to_string()).or_default();
            let transition = breaker.on_failure(&self.config, now);
            (transition, breaker.consecutive_failures())
        };

        if let Some(state) = transition {
            warn!(
                server = server_id,
                state = %state,
                consecutive_failures = failures,
                "circuit breaker transition"
            );
        }
        transition
    }

    /// Current state, closed if the server has no breaker yet.
    pub fn state(&self, server_id: &str) -> CircuitState {
        self.breakers
            .get(server_id)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Serializable view of a server's breaker.
    pub fn snapshot(&self, server_id: &str) -> CircuitSnapshot {
        let now = self.clock.now();
        self.breakers
            .get(server_id)
            .map(|b| b.snapshot(now))
            .unwrap_or_default()
    }

    /// Forget a server's breaker.
    pub fn remove(&self, server_id: &str) {
        self.breakers.remove(server_id);
    }
}
