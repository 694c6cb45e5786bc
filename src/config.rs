//! # Configuration Management
//!
//! Centralized configuration for the RPC transport.
//!
//! This module provides structured configuration for the reactor pool, the
//! crypto engine and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment overrides via `from_env()` (`REACTOR_RPC_*` variables)
//!
//! ## Tuning Notes
//! - `write_budget` bounds how many bytes one connection may write per reactor
//!   pass; a connection that still has data goes to the back of the line
//! - Buffers are shrunk back to `max_*_buffer_size` when they drain, never capped
//! - `tick` is both the timer wheel resolution and the longest reactor sleep

use crate::error::{ProtocolError, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Largest packet accepted by default (16 MB)
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

/// Default per-connection buffer size kept between bursts
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default bytes one connection may move per reactor pass
pub const DEFAULT_WRITE_BUDGET: usize = 256 * 1024;

/// Default timer wheel tick
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// Default outbound connect timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Reactor and buffering configuration
    #[serde(default)]
    pub transport: TransportConfig,

    /// Transport encryption configuration
    #[serde(default)]
    pub crypto: CryptoConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(val) = env_parse::<usize>("REACTOR_RPC_THREADS")? {
            config.transport.threads = val;
        }

        if let Some(val) = env_parse::<u64>("REACTOR_RPC_TICK_MS")? {
            config.transport.tick = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<u64>("REACTOR_RPC_CONNECT_TIMEOUT_MS")? {
            config.transport.connect_timeout = Duration::from_millis(val);
        }

        if let Some(val) = env_parse::<usize>("REACTOR_RPC_MAX_PACKET_SIZE")? {
            config.transport.max_packet_size = val;
        }

        if let Ok(mode) = std::env::var("REACTOR_RPC_CRYPTO_MODE") {
            config.crypto.mode = mode.parse()?;
        }

        if let Ok(level) = std::env::var("REACTOR_RPC_LOG_LEVEL") {
            config.logging.log_level = level
                .parse()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.transport.validate());
        errors.extend(self.crypto.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {name}: '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Reactor pool and buffering configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Number of reactor threads
    pub threads: usize,

    /// Disable Nagle on every socket
    pub tcp_no_delay: bool,

    /// Input buffer size kept between bursts
    pub max_input_buffer_size: usize,

    /// Output buffer size kept between bursts
    pub max_output_buffer_size: usize,

    /// Ask the crypto layer to release idle buffers
    pub drop_empty_buffers: bool,

    /// Bytes one connection may read or write per reactor pass
    pub write_budget: usize,

    /// Largest accepted packet, header included
    pub max_packet_size: usize,

    /// Timer wheel tick and longest reactor sleep
    #[serde(with = "duration_serde")]
    pub tick: Duration,

    /// Pending jobs the worker thread accepts before callers run them inline
    pub worker_queue_size: usize,

    /// Timeout for outbound connection attempts
    #[serde(with = "duration_serde")]
    pub connect_timeout: Duration,

    /// Threads resolving and connecting outbound sockets
    pub connector_threads: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            threads: 1,
            tcp_no_delay: true,
            max_input_buffer_size: DEFAULT_BUFFER_SIZE,
            max_output_buffer_size: DEFAULT_BUFFER_SIZE,
            drop_empty_buffers: false,
            write_budget: DEFAULT_WRITE_BUDGET,
            max_packet_size: MAX_PACKET_SIZE,
            tick: DEFAULT_TICK,
            worker_queue_size: 64,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            connector_threads: 1,
        }
    }
}

impl TransportConfig {
    /// Validate transport configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.threads == 0 {
            errors.push("Reactor thread count must be greater than 0".to_string());
        } else if self.threads > 256 {
            errors.push(format!(
                "Reactor thread count too large: {} (maximum: 256)",
                self.threads
            ));
        }

        if self.max_input_buffer_size < 1024 || self.max_output_buffer_size < 1024 {
            errors.push("Buffer sizes too small (minimum: 1 KB)".to_string());
        }

        if self.write_budget == 0 {
            errors.push("Write budget must be greater than 0".to_string());
        }

        if self.max_packet_size < 1024 {
            errors.push("Max packet size too small (minimum: 1 KB)".to_string());
        } else if self.max_packet_size > 1024 * 1024 * 1024 {
            errors.push(format!(
                "Max packet size too large: {} bytes (maximum: 1 GB)",
                self.max_packet_size
            ));
        }

        if self.tick.as_millis() < 1 {
            errors.push("Scheduler tick too short (minimum: 1ms)".to_string());
        } else if self.tick.as_secs() > 10 {
            errors.push("Scheduler tick too long (maximum: 10s)".to_string());
        }

        if self.worker_queue_size == 0 {
            errors.push("Worker queue size must be greater than 0".to_string());
        }

        if self.connect_timeout.as_millis() < 10 {
            errors.push("Connect timeout too short (minimum: 10ms)".to_string());
        } else if self.connect_timeout.as_secs() > 300 {
            errors.push("Connect timeout too long (maximum: 300s)".to_string());
        }

        if self.connector_threads == 0 {
            errors.push("Connector thread count must be greater than 0".to_string());
        }

        errors
    }
}

/// Which crypto engine a transport uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CryptoMode {
    /// Plaintext
    #[default]
    None,
    /// Single-byte XOR obfuscation, for exercising the crypto path in tests
    Xor,
    /// TLS on every connection
    Tls,
    /// TLS clients, servers accept both TLS and plaintext peers
    MaybeTls,
}

impl std::str::FromStr for CryptoMode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CryptoMode::None),
            "xor" => Ok(CryptoMode::Xor),
            "tls" => Ok(CryptoMode::Tls),
            "maybe_tls" => Ok(CryptoMode::MaybeTls),
            other => Err(ProtocolError::ConfigError(format!(
                "Unknown crypto mode: '{other}' (expected none, xor, tls or maybe_tls)"
            ))),
        }
    }
}

/// Capabilities granted to a peer identified by certificate fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PeerPolicy {
    /// Hex SHA-256 of the peer's leaf certificate (DER)
    pub fingerprint: String,

    /// Capability names granted to that peer
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Transport encryption configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct CryptoConfig {
    pub mode: CryptoMode,

    /// PEM certificate chain presented by this side
    pub cert_path: Option<String>,

    /// PEM private key matching `cert_path`
    pub key_path: Option<String>,

    /// PEM bundle of trusted CA certificates
    pub ca_path: Option<String>,

    /// Reject peers that do not present a certificate trusted by `ca_path`
    pub require_peer_cert: bool,

    /// SNI name to present when connecting, instead of the host being dialed
    pub server_name: Option<String>,

    /// Per-peer capability grants
    pub peers: Vec<PeerPolicy>,
}

impl CryptoConfig {
    /// Validate crypto configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.mode == CryptoMode::Xor {
            errors.push("WARNING: xor crypto is for testing only".to_string());
        }

        if matches!(self.mode, CryptoMode::Tls | CryptoMode::MaybeTls) {
            if self.cert_path.is_some() != self.key_path.is_some() {
                errors.push("cert_path and key_path must be set together".to_string());
            }
            for path in [&self.cert_path, &self.key_path, &self.ca_path]
                .into_iter()
                .flatten()
            {
                if !Path::new(path).exists() {
                    errors.push(format!("PEM file does not exist: {path}"));
                }
            }
            if self.require_peer_cert && self.ca_path.is_none() {
                errors.push("require_peer_cert needs ca_path".to_string());
            }
        } else if self.require_peer_cert || !self.peers.is_empty() {
            errors.push("Peer certificates are only checked in tls and maybe_tls modes".to_string());
        }

        for peer in &self.peers {
            let hex_ok = peer.fingerprint.len() == 64
                && peer.fingerprint.chars().all(|c| c.is_ascii_hexdigit());
            if !hex_ok {
                errors.push(format!(
                    "Invalid peer fingerprint: '{}' (expected 64 hex characters)",
                    peer.fingerprint
                ));
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("reactor-rpc"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(NetworkConfig::default().validate().is_empty());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = NetworkConfig::from_toml(
            r#"
            [transport]
            threads = 4
            tick = 50

            [crypto]
            mode = "maybe_tls"
            "#,
        )
        .expect("parse");
        assert_eq!(config.transport.threads, 4);
        assert_eq!(config.transport.tick, Duration::from_millis(50));
        assert_eq!(config.transport.write_budget, DEFAULT_WRITE_BUDGET);
        assert_eq!(config.crypto.mode, CryptoMode::MaybeTls);
    }

    #[test]
    fn test_crypto_mode_parse() {
        assert_eq!("TLS".parse::<CryptoMode>().expect("tls"), CryptoMode::Tls);
        assert!("rot13".parse::<CryptoMode>().is_err());
    }
}
