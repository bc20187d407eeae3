//! Logging initialization.

use crate::config::LogFormat;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level` when it is set. Fails if a
/// subscriber is already installed.
pub fn init_logging(level: &str, format: &LogFormat) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()?,
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init()?,
        LogFormat::Compact => registry
            .with(fmt::layer().compact().with_target(false))
            .try_init()?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only one global subscriber per process, so the happy path is left to the binary.
    #[test]
    fn test_second_init_fails() {
        let first = init_logging("info", &LogFormat::Compact);
        let second = init_logging("info", &LogFormat::Compact);
        assert!(first.is_ok() || second.is_err());
        assert!(second.is_err());
    }
}
