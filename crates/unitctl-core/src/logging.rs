//! Process-level tracing setup for unitctl binaries.

use std::sync::OnceLock;

static INIT: OnceLock<()> = OnceLock::new();

/// Environment variable selecting the log level.
pub const LOG_ENV: &str = "UNITCTL_LOG";

fn level_from(value: Option<&str>) -> tracing::Level {
    match value.unwrap_or("info").to_ascii_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}

/// Initialize tracing output from `UNITCTL_LOG`, writing to stderr.
///
/// Only the first call installs a subscriber; later calls are no-ops.
/// Never fails.
pub fn init() {
    init_with(std::env::var(LOG_ENV).ok().as_deref());
}

/// Like [`init`], with an explicit level overriding the environment.
pub fn init_with(level: Option<&str>) {
    if INIT.get().is_some() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(level_from(level))
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(level_from(None), tracing::Level::INFO);
        assert_eq!(level_from(Some("DEBUG")), tracing::Level::DEBUG);
        assert_eq!(level_from(Some("warn")), tracing::Level::WARN);
        assert_eq!(level_from(Some("bogus")), tracing::Level::INFO);
    }

    #[test]
    fn test_init_is_idempotent() {
        init_with(Some("error"));
        init_with(Some("trace"));
        assert!(INIT.get().is_some());
    }
}
