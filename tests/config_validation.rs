//! Integration tests for configuration validation

#![allow(clippy::unwrap_used, clippy::expect_used)]

use reactor_rpc::config::{CryptoMode, LoggingConfig, NetworkConfig, PeerPolicy, TransportConfig};
use reactor_rpc::error::ProtocolError;
use reactor_rpc::transport::Transport;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_zero_threads() {
    let mut config = NetworkConfig::default();
    config.transport.threads = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("thread count must be greater than 0")));
}

#[test]
fn test_too_many_threads() {
    let mut config = NetworkConfig::default();
    config.transport.threads = 1000;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("thread count too large")));
}

#[test]
fn test_tiny_buffers() {
    let mut config = NetworkConfig::default();
    config.transport.max_input_buffer_size = 16;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Buffer sizes too small")));
}

#[test]
fn test_zero_write_budget() {
    let mut config = NetworkConfig::default();
    config.transport.write_budget = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Write budget")));
}

#[test]
fn test_max_packet_size_bounds() {
    let mut config = NetworkConfig::default();
    config.transport.max_packet_size = 100;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max packet size too small")));

    config.transport.max_packet_size = 2 * 1024 * 1024 * 1024;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max packet size too large")));
}

#[test]
fn test_tick_bounds() {
    let mut config = NetworkConfig::default();
    config.transport.tick = Duration::from_micros(10);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("tick too short")));

    config.transport.tick = Duration::from_secs(60);
    assert!(config.validate().iter().any(|e| e.contains("tick too long")));
}

#[test]
fn test_connect_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.transport.connect_timeout = Duration::from_millis(1);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connect timeout too short")));

    config.transport.connect_timeout = Duration::from_secs(3600);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Connect timeout too long")));
}

#[test]
fn test_zero_worker_queue_and_connector_threads() {
    let mut config = NetworkConfig::default();
    config.transport.worker_queue_size = 0;
    config.transport.connector_threads = 0;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Worker queue size")));
    assert!(errors.iter().any(|e| e.contains("Connector thread count")));
}

#[test]
fn test_xor_crypto_warning() {
    let mut config = NetworkConfig::default();
    config.crypto.mode = CryptoMode::Xor;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("WARNING")));
}

#[test]
fn test_tls_missing_key() {
    let mut config = NetworkConfig::default();
    config.crypto.mode = CryptoMode::Tls;
    config.crypto.cert_path = Some("/nonexistent/cert.pem".to_string());

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("cert_path and key_path must be set together")));
    assert!(errors.iter().any(|e| e.contains("PEM file does not exist")));
}

#[test]
fn test_require_peer_cert_without_ca() {
    let mut config = NetworkConfig::default();
    config.crypto.mode = CryptoMode::Tls;
    config.crypto.require_peer_cert = true;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("needs ca_path")));
}

#[test]
fn test_peer_policy_without_tls() {
    let mut config = NetworkConfig::default();
    config.crypto.peers.push(PeerPolicy {
        fingerprint: "ab".repeat(32),
        capabilities: vec!["admin".to_string()],
    });

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("only checked in tls and maybe_tls")));
}

#[test]
fn test_bad_peer_fingerprint() {
    let mut config = NetworkConfig::default();
    config.crypto.mode = CryptoMode::MaybeTls;
    config.crypto.peers.push(PeerPolicy {
        fingerprint: "not-hex".to_string(),
        capabilities: Vec::new(),
    });

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid peer fingerprint")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = "a".repeat(100);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("too long")));
}

#[test]
fn test_log_to_file_without_path() {
    let config = NetworkConfig {
        logging: LoggingConfig {
            log_to_file: true,
            log_file_path: None,
            ..Default::default()
        },
        ..Default::default()
    };

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_output() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_collects_errors() {
    let mut config = NetworkConfig::default();
    config.transport.threads = 0;
    config.transport.write_budget = 0;

    let err = config.validate_strict().unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("Configuration validation failed"));
    assert!(msg.contains("thread count"));
    assert!(msg.contains("Write budget"));
}

#[test]
fn test_toml_round_trip_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rpc.toml");

    let config = NetworkConfig::default_with_overrides(|c| {
        c.transport.threads = 4;
        c.transport.tick = Duration::from_millis(25);
        c.crypto.mode = CryptoMode::MaybeTls;
        c.logging.log_level = Level::DEBUG;
    });
    config.save_to_file(&path).unwrap();

    let loaded = NetworkConfig::from_file(&path).unwrap();
    assert_eq!(loaded.transport.threads, 4);
    assert_eq!(loaded.transport.tick, Duration::from_millis(25));
    assert_eq!(loaded.crypto.mode, CryptoMode::MaybeTls);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = NetworkConfig::from_toml(
        r#"
        [transport]
        threads = 2

        [crypto]
        mode = "xor"
        "#,
    )
    .unwrap();

    assert_eq!(config.transport.threads, 2);
    assert_eq!(
        config.transport.write_budget,
        TransportConfig::default().write_budget
    );
    assert_eq!(config.crypto.mode, CryptoMode::Xor);
}

#[test]
fn test_unknown_crypto_mode_rejected() {
    assert!(matches!(
        "rot13".parse::<CryptoMode>(),
        Err(ProtocolError::ConfigError(_))
    ));
    assert!(NetworkConfig::from_toml("[crypto]\nmode = \"rot13\"\n").is_err());
}

#[test]
fn test_transport_refuses_invalid_config() {
    let config = TransportConfig {
        threads: 0,
        ..Default::default()
    };
    let result = Transport::builder().config(config).build();
    assert!(matches!(result, Err(ProtocolError::ConfigError(_))));
}
