//! Configuration types

use serde::{Deserialize, Serialize};

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Bus connection configuration
    #[serde(default)]
    pub bus: BusConfig,
    /// CLI configuration
    #[serde(default)]
    pub cli: CliConfig,
}

/// Which bus to connect to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    /// The system bus, where PID 1 lives
    #[default]
    System,
    /// The calling user's session bus (`systemd --user`)
    Session,
    /// An explicit D-Bus address from `bus.address`
    Address,
}

/// Bus connection configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Bus to connect to
    #[serde(default)]
    pub kind: BusKind,
    /// D-Bus address, required when `kind = "address"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// How often change subscriptions re-list units (default: 1000 ms)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            kind: BusKind::System,
            address: None,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// CLI configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Deadline applied to every command, in seconds (default: 30)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Output format
    #[serde(default)]
    pub format: OutputFormat,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            format: OutputFormat::Text,
        }
    }
}

/// Output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Plain text output
    #[default]
    Text,
    /// JSON output
    Json,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::default();
        assert_eq!(config.bus.kind, BusKind::System);
        assert_eq!(config.bus.address, None);
        assert_eq!(config.bus.poll_interval_ms, 1000);
        assert_eq!(config.cli.timeout_secs, 30);
        assert_eq!(config.cli.format, OutputFormat::Text);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config, deserialized);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let toml_str = r#"
[bus]
kind = "address"
address = "unix:path=/run/dbus/system_bus_socket"

[cli]
format = "json"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.bus.kind, BusKind::Address);
        assert_eq!(
            config.bus.address.as_deref(),
            Some("unix:path=/run/dbus/system_bus_socket")
        );
        assert_eq!(config.bus.poll_interval_ms, 1000);
        assert_eq!(config.cli.timeout_secs, 30);
        assert_eq!(config.cli.format, OutputFormat::Json);
    }
}
