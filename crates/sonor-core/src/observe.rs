//! Structured logging setup
//!
//! The engine logs through `tracing`; this module wires a global
//! subscriber for binaries and tests that want one. Libraries embedding
//! the engine usually install their own subscriber instead and can ignore
//! this entirely.

use serde::{Deserialize, Serialize};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        };
        write!(f, "{name}")
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Verbosity floor; `RUST_LOG` overrides it when set.
    pub level: LogLevel,
    /// Emit machine-readable JSON lines instead of human output.
    pub json: bool,
    /// Tag every event with its thread name; useful when reading batch
    /// interleavings.
    pub thread_names: bool,
}

/// Install the global subscriber. Safe to call more than once; only the
/// first call wins.
pub fn init_logging(config: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.to_string()));
    let result = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_thread_names(config.thread_names),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().compact().with_thread_names(config.thread_names))
            .try_init()
    };
    // A second init keeps the existing subscriber
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        init_logging(&LogConfig::default());
        init_logging(&LogConfig {
            level: LogLevel::Debug,
            json: true,
            thread_names: true,
        });
        tracing::debug!("logging initialised twice without panicking");
    }

    #[test]
    fn test_level_display() {
        assert_eq!(LogLevel::Warn.to_string(), "warn");
        assert_eq!(LogLevel::default(), LogLevel::Info);
    }
}
