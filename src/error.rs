//! # Error Types
//!
//! Error handling for the RPC transport.
//!
//! Errors fall into two families:
//! - **Local / connection errors** ([`ProtocolError`]): malformed address specs,
//!   connect and listen failures, wire decode failures, handshake and TLS
//!   failures. Setup errors are returned synchronously; anything that happens
//!   after a connection is up closes that connection.
//! - **RPC errors** (`(code, message)` pairs on a [`Request`](crate::protocol::request::Request)):
//!   unknown method, wrong parameter types, handler failure, timeouts and so on.
//!   These travel on the reply path and never affect connection validity.
//!
//! ## Example Usage
//! ```rust
//! use reactor_rpc::error::{ProtocolError, Result};
//! use reactor_rpc::transport::spec::Spec;
//!
//! fn parse(addr: &str) -> Result<Spec> {
//!     let spec = Spec::parse(addr);
//!     if spec.malformed() {
//!         return Err(ProtocolError::MalformedSpec(addr.to_string()));
//!     }
//!     Ok(spec)
//! }
//!
//! assert!(parse("tcp/localhost:8080").is_ok());
//! assert!(parse("udp/8080").is_err());
//! ```

use std::io;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Wire validation errors
    pub const ERR_INVALID_HEADER: &str = "Invalid packet header";
    pub const ERR_UNKNOWN_PACKET_CODE: &str = "Unknown packet code";
    pub const ERR_TRAILING_BYTES: &str = "Packet body does not fill its declared length";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_CONNECTION_EOF: &str = "Connection closed by peer";
    pub const ERR_TRANSPORT_SHUTDOWN: &str = "Transport is shutting down";

    /// Handshake errors
    pub const ERR_RENEGOTIATION: &str = "Handshake already completed; renegotiation is not allowed";
    pub const ERR_HANDSHAKE_DATA: &str = "Application data received during handshake";
    pub const ERR_HANDSHAKE_FAILED: &str = "Handshake failed";

    /// RPC-level messages
    pub const ERR_REQUEST_ABORTED: &str = "Aborted by user";
    pub const ERR_REQUEST_TIMEOUT: &str = "Request timed out";
    pub const ERR_CONNECTION_DOWN: &str = "Connection error";
}

/// Failure decoding a [`Value`](crate::core::value::Value) or a packet body.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes yet; retry once more data has arrived.
    #[error("Insufficient data: needed {needed} bytes, {available} available")]
    Insufficient { needed: usize, available: usize },

    /// The type tag does not name any known value type.
    #[error("Unknown value type tag: {0:#04x}")]
    UnknownType(u8),

    /// A string value did not hold valid UTF-8.
    #[error("String value is not valid UTF-8")]
    InvalidUtf8,
}

impl DecodeError {
    /// Whether the connection the bytes came from must be closed.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, DecodeError::Insufficient { .. })
    }
}

// ProtocolError is the primary error type for all transport operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Malformed address spec: '{0}' (expected 'tcp/<port>' or 'tcp/<host>:<port>')")]
    MalformedSpec(String),

    #[error("Failed to connect to {spec}: {source}")]
    Connect {
        spec: String,
        #[source]
        source: io::Error,
    },

    #[error("Failed to listen on {spec}: {source}")]
    Listen {
        spec: String,
        #[source]
        source: io::Error,
    },

    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Transport is shutting down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ProtocolError {
    /// Wrap an I/O failure raised while establishing an outbound connection.
    pub fn connect(spec: impl ToString, source: io::Error) -> Self {
        ProtocolError::Connect {
            spec: spec.to_string(),
            source,
        }
    }

    /// Wrap an I/O failure raised while binding a listener.
    pub fn listen(spec: impl ToString, source: io::Error) -> Self {
        ProtocolError::Listen {
            spec: spec.to_string(),
            source,
        }
    }
}

impl From<rustls::Error> for ProtocolError {
    fn from(err: rustls::Error) -> Self {
        ProtocolError::TlsError(err.to_string())
    }
}

/// Type alias for Results using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_error_fatality() {
        let short = DecodeError::Insufficient {
            needed: 4,
            available: 1,
        };
        assert!(!short.is_fatal());
        assert!(DecodeError::UnknownType(b'?').is_fatal());
        assert!(DecodeError::InvalidUtf8.is_fatal());
    }

    #[test]
    fn test_connect_error_keeps_source() {
        let err = ProtocolError::connect(
            "tcp/localhost:1",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        let text = err.to_string();
        assert!(text.contains("tcp/localhost:1"));
        assert!(text.contains("refused"));
    }
}
