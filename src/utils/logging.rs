//! # Logging Setup
//!
//! Installs a `tracing-subscriber` fmt subscriber from a [`LoggingConfig`].
//!
//! `RUST_LOG` directives, when present, are appended to the configured level so
//! per-module overrides keep working. Installing twice is harmless: the second
//! call leaves the first subscriber in place and returns `Ok(false)`.

use std::fs::OpenOptions;
use std::sync::Mutex;

use tracing::info;
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};

fn env_filter(config: &LoggingConfig) -> EnvFilter {
    let base = config.log_level.to_string().to_lowercase();
    let directives = match std::env::var("RUST_LOG") {
        Ok(extra) if !extra.trim().is_empty() => format!("{base},{}", extra.trim()),
        _ => base.clone(),
    };
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(base))
}

fn make_writer(config: &LoggingConfig) -> Result<BoxMakeWriter> {
    let file = match (config.log_to_file, &config.log_file_path) {
        (true, Some(path)) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| {
                    ProtocolError::ConfigError(format!("Failed to open log file {path}: {e}"))
                })?,
        ),
        _ => None,
    };

    let writer = match (config.log_to_console, file) {
        (true, Some(file)) => BoxMakeWriter::new(std::io::stderr.and(Mutex::new(file))),
        (false, Some(file)) => BoxMakeWriter::new(Mutex::new(file)),
        (_, None) => BoxMakeWriter::new(std::io::stderr),
    };
    Ok(writer)
}

/// Install the global subscriber.
///
/// Returns `Ok(true)` if this call installed it, `Ok(false)` if one was
/// already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<bool> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(make_writer(config)?)
        .with_target(true);

    let installed = if config.json_format {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };

    if installed {
        info!(app = %config.app_name, level = %config.log_level, "Logging initialized");
    }
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_noop() {
        let config = LoggingConfig::default();
        let _ = init_logging(&config).expect("first");
        assert!(!init_logging(&config).expect("second"));
    }

    #[test]
    fn test_unopenable_file_is_config_error() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: Some("/nonexistent-dir/for/sure/log.txt".to_string()),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(ProtocolError::ConfigError(_))
        ));
    }
}
