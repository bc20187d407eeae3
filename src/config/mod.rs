//! Configuration loading, parsing, and validation.

mod loader;
mod types;
mod validation;

pub use loader::{load_config, parse_config, ConfigError};
pub use types::*;
pub use validation::{validate_config, validate_server};
pub(crate) use types::{humantime_serde, option_humantime_serde};
