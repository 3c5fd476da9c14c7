//! Configuration discovery and resolution

use super::types::{BusKind, Config, OutputFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};

/// System-wide config file
pub const SYSTEM_CONFIG_PATH: &str = "/etc/unitctl/config.toml";

/// Configuration error
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// TOML parsing error
    #[error("TOML parsing error in {path}: {source}")]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// Invalid value in an environment variable
    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Command-line overrides for configuration
#[derive(Debug, Default, Clone)]
pub struct ConfigOverrides {
    /// Explicit config file; must exist and parse
    pub config_path: Option<PathBuf>,
    /// Override bus kind
    pub bus_kind: Option<BusKind>,
    /// Override bus address (implies `BusKind::Address`)
    pub bus_address: Option<String>,
    /// Override command timeout
    pub timeout_secs: Option<u64>,
    /// Override output format
    pub format: Option<OutputFormat>,
}

/// Resolve configuration from all sources
///
/// Priority (highest to lowest):
/// 1. Command-line overrides
/// 2. Environment variables (`UNITCTL_BUS`, `UNITCTL_TIMEOUT_SECS`)
/// 3. Explicit `--config` file, then user config (~/.config/unitctl/config.toml)
/// 4. System config (/etc/unitctl/config.toml)
/// 5. Defaults
///
/// Discovered files that fail to parse are logged and skipped; an explicit
/// `--config` file that fails to load is an error.
pub fn resolve_config(
    overrides: &ConfigOverrides,
    system_config: &Path,
    home_dir: Option<&Path>,
) -> Result<Config, ConfigError> {
    let mut config = Config::default();

    // 4. Try system config
    merge_discovered(&mut config, system_config);

    // 3. Try user config
    if let Some(home) = home_dir {
        merge_discovered(&mut config, &home.join(".config/unitctl/config.toml"));
    }

    // An explicit file sits above the discovered ones but below the
    // environment and the flags.
    if let Some(ref path) = overrides.config_path {
        let file_config = load_config_file(path)?;
        debug!("Loaded explicit config from {}", path.display());
        merge_config(&mut config, file_config);
    }

    // 2. Apply environment variables
    apply_env_overrides(&mut config)?;

    // 1. Apply command-line overrides
    apply_cli_overrides(&mut config, overrides);

    Ok(config)
}

/// Keys present in one config file. Absent keys leave lower layers alone.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    bus: FileBusConfig,
    cli: FileCliConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileBusConfig {
    kind: Option<BusKind>,
    address: Option<String>,
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileCliConfig {
    timeout_secs: Option<u64>,
    format: Option<OutputFormat>,
}

fn merge_discovered(config: &mut Config, path: &Path) {
    if !path.exists() {
        return;
    }
    match load_config_file(path) {
        Ok(file_config) => {
            debug!("Loaded config from {}", path.display());
            merge_config(config, file_config);
        }
        Err(e) => warn!("Failed to parse config at {}: {}", path.display(), e),
    }
}

/// Load config from a TOML file
fn load_config_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::TomlParse {
        path: path.to_path_buf(),
        source,
    })
}

/// Merge the keys a file sets into the base config
fn merge_config(base: &mut Config, file: FileConfig) {
    if let Some(kind) = file.bus.kind {
        base.bus.kind = kind;
    }
    if file.bus.address.is_some() {
        base.bus.address = file.bus.address;
    }
    if let Some(interval) = file.bus.poll_interval_ms {
        base.bus.poll_interval_ms = interval;
    }

    if let Some(timeout) = file.cli.timeout_secs {
        base.cli.timeout_secs = timeout;
    }
    if let Some(format) = file.cli.format {
        base.cli.format = format;
    }
}

/// Apply environment variable overrides
fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(bus) = std::env::var("UNITCTL_BUS") {
        match bus.as_str() {
            "system" => config.bus.kind = BusKind::System,
            "session" | "user" => config.bus.kind = BusKind::Session,
            address if address.contains(':') => {
                config.bus.kind = BusKind::Address;
                config.bus.address = Some(address.to_string());
            }
            _ => {
                return Err(ConfigError::InvalidEnv {
                    var: "UNITCTL_BUS",
                    value: bus,
                });
            }
        }
    }

    if let Ok(timeout) = std::env::var("UNITCTL_TIMEOUT_SECS") {
        config.cli.timeout_secs = timeout.parse().map_err(|_| ConfigError::InvalidEnv {
            var: "UNITCTL_TIMEOUT_SECS",
            value: timeout.clone(),
        })?;
    }

    Ok(())
}

/// Apply command-line overrides
fn apply_cli_overrides(config: &mut Config, overrides: &ConfigOverrides) {
    if let Some(kind) = overrides.bus_kind {
        config.bus.kind = kind;
    }

    if let Some(ref address) = overrides.bus_address {
        config.bus.kind = BusKind::Address;
        config.bus.address = Some(address.clone());
    }

    if let Some(timeout) = overrides.timeout_secs {
        config.cli.timeout_secs = timeout;
    }

    if let Some(format) = overrides.format {
        config.cli.format = format;
    }
}
