//! Configuration validation.

use crate::backend::ServerDescriptor;
use crate::config::Config;
use std::collections::HashSet;

/// Validate the configuration.
///
/// Checks for:
/// - At least one server, with unique non-empty IDs
/// - Weights and connection limits of at least 1
/// - Health check paths starting with `/`
/// - Health check timeout strictly below the interval
/// - Sane breaker, ring and window sizes
/// - A known log level
///
/// # Returns
///
/// `Ok(())` if valid, or every problem found joined into one message.
pub fn validate_config(config: &Config) -> Result<(), String> {
    let mut errors = Vec::new();

    if config.servers.is_empty() {
        errors.push("at least one server must be defined".to_string());
    }

    let mut ids = HashSet::new();
    for server in &config.servers {
        if !ids.insert(server.id.as_str()) {
            errors.push(format!("duplicate server id: {}", server.id));
        }
        errors.extend(validate_server(server));
    }

    let balancer = &config.balancer;

    if balancer.health_check_timeout >= balancer.health_check_interval {
        errors.push(format!(
            "health_check_timeout ({:?}) must be shorter than health_check_interval ({:?})",
            balancer.health_check_timeout, balancer.health_check_interval
        ));
    }

    if balancer.circuit_breaker.threshold == 0 {
        errors.push("circuit_breaker.threshold must be >= 1".to_string());
    }

    if balancer.virtual_nodes == 0 {
        errors.push("virtual_nodes must be >= 1".to_string());
    }

    if balancer.response_window == 0 {
        errors.push("response_window must be >= 1".to_string());
    }

    if balancer.session_sweep_interval.is_zero() {
        errors.push("session_sweep_interval must be greater than zero".to_string());
    }

    if !config.global.metrics.path.starts_with('/') {
        errors.push(format!(
            "metrics path '{}' must start with '/'",
            config.global.metrics.path
        ));
    }

    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if !valid_levels.contains(&config.global.log_level.to_lowercase().as_str()) {
        errors.push(format!(
            "invalid log level '{}', must be one of: {}",
            config.global.log_level,
            valid_levels.join(", ")
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

/// Validate a single server descriptor.
///
/// Also used when servers are registered at runtime through the admin API.
pub fn validate_server(server: &ServerDescriptor) -> Vec<String> {
    let mut errors = Vec::new();

    if server.id.trim().is_empty() {
        errors.push("server id cannot be empty".to_string());
    }

    if server.host.trim().is_empty() {
        errors.push(format!("server '{}' has an empty host", server.id));
    }

    if server.weight == 0 {
        errors.push(format!(
            "server '{}' has weight 0 (must be >= 1)",
            server.id
        ));
    }

    if server.max_connections == 0 {
        errors.push(format!(
            "server '{}' has max_connections 0 (must be >= 1)",
            server.id
        ));
    }

    if !server.health_check_path.starts_with('/') {
        errors.push(format!(
            "server '{}' health_check_path '{}' must start with '/'",
            server.id, server.health_check_path
        ));
    }

    if server.request_timeout.is_zero() {
        errors.push(format!(
            "server '{}' request_timeout must be greater than zero",
            server.id
        ));
    }

    errors
}
