//! Configuration resolution
//!
//! Resolves configuration from multiple sources with priority:
//! 1. Command-line flags (passed as parameters)
//! 2. Environment variables
//! 3. User config (~/.config/unitctl/config.toml)
//! 4. System config (/etc/unitctl/config.toml)
//! 5. Defaults

mod discovery;
mod types;

pub use discovery::{ConfigError, ConfigOverrides, SYSTEM_CONFIG_PATH, resolve_config};
pub use types::{BusConfig, BusKind, CliConfig, Config, OutputFormat};
