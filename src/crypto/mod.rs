//! # Transport Encryption
//!
//! Pluggable per-connection encryption.
//!
//! A [`CryptoSocket`] holds the cipher state of one connection. It never owns the
//! TCP stream: every I/O call borrows the connection's stream, so the reactor
//! keeps its registration while a socket is off on the worker thread doing
//! [`CryptoSocket::do_handshake_work`].
//!
//! ## Handshake
//! `handshake()` is called until it returns [`HandshakeResult::Done`]:
//! - `NeedRead` / `NeedWrite`: wait for that readiness, then call again
//! - `NeedWork`: run `do_handshake_work()` (off the reactor), then call again
//!
//! Calling `handshake()` after `Done` is an error; renegotiation is not allowed.
//!
//! ## Engines
//! - **Null**: plaintext passthrough
//! - **Xor**: single-byte key obfuscation for exercising the crypto path in tests
//! - **Tls**: rustls
//! - **MaybeTls**: TLS clients; servers sniff the first bytes and accept both
//!
//! All I/O errors are connection-fatal. Reads report end-of-stream as an error
//! so a quiet socket and a closed one can never be confused.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use crate::config::{CryptoConfig, CryptoMode};
use crate::error::{constants, Result};
use crate::transport::spec::Spec;

pub mod maybe_tls;
pub mod null;
pub mod tls;
pub mod xor;

pub use maybe_tls::MaybeTlsCryptoEngine;
pub use null::NullCryptoEngine;
pub use tls::{TlsConfig, TlsCryptoEngine};
pub use xor::XorCryptoEngine;

/// Byte stream a crypto socket reads from and writes to.
pub trait Stream: io::Read + io::Write {}

impl<T: io::Read + io::Write> Stream for T {}

/// Outcome of one handshake step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeResult {
    Done,
    NeedRead,
    NeedWrite,
    NeedWork,
}

/// Outcome of pushing buffered ciphertext to the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    Done,
    NeedWrite,
}

/// Cipher state of one connection.
pub trait CryptoSocket: Send {
    /// Advance the handshake as far as the socket allows.
    fn handshake(&mut self, io: &mut dyn Stream) -> io::Result<HandshakeResult>;

    /// CPU-heavy handshake step; may run on any thread.
    fn do_handshake_work(&mut self);

    /// Smallest read buffer worth offering to [`CryptoSocket::read`].
    fn min_read_buffer(&self) -> usize {
        4096
    }

    /// Read plaintext into `dst`, pulling from the socket if nothing is buffered.
    ///
    /// `Ok(0)` means nothing is available right now. End of stream is an error.
    fn read(&mut self, io: &mut dyn Stream, dst: &mut [u8]) -> io::Result<usize>;

    /// Hand out plaintext that is already decrypted, without touching the socket.
    fn drain(&mut self, dst: &mut [u8]) -> io::Result<usize>;

    /// Accept up to `src.len()` plaintext bytes. `Ok(0)` means the socket is full.
    fn write(&mut self, io: &mut dyn Stream, src: &[u8]) -> io::Result<usize>;

    /// Push buffered ciphertext to the socket.
    fn flush(&mut self, io: &mut dyn Stream) -> io::Result<FlushResult>;

    /// Release internal buffers that are currently empty.
    fn drop_empty_buffers(&mut self) {}

    /// Identity and capabilities of the peer, final once the handshake is done.
    fn auth_context(&self) -> AuthContext {
        AuthContext::unauthenticated()
    }
}

/// Creates crypto sockets for new connections.
pub trait CryptoEngine: Send + Sync {
    fn create_client_crypto(&self, spec: &Spec) -> Result<Box<dyn CryptoSocket>>;

    fn create_server_crypto(&self) -> Result<Box<dyn CryptoSocket>>;

    /// Release engine resources; called once, after every reactor has exited.
    fn close(&self) {}

    fn name(&self) -> &'static str;
}

/// Build the engine named by `config.mode`.
pub fn engine_from_config(config: &CryptoConfig) -> Result<Arc<dyn CryptoEngine>> {
    let engine: Arc<dyn CryptoEngine> = match config.mode {
        CryptoMode::None => Arc::new(NullCryptoEngine),
        CryptoMode::Xor => Arc::new(XorCryptoEngine),
        CryptoMode::Tls => Arc::new(TlsCryptoEngine::new(TlsConfig::from_crypto_config(config)?)?),
        CryptoMode::MaybeTls => Arc::new(MaybeTlsCryptoEngine::new(TlsCryptoEngine::new(
            TlsConfig::from_crypto_config(config)?,
        )?)),
    };
    Ok(engine)
}

/// Capabilities held by a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capabilities {
    /// No access policy is configured; everything is allowed.
    All,
    Set(HashSet<String>),
}

/// What the crypto layer knows about the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    peer_fingerprint: Option<String>,
    capabilities: Capabilities,
}

impl AuthContext {
    pub fn unauthenticated() -> Self {
        Self {
            peer_fingerprint: None,
            capabilities: Capabilities::All,
        }
    }

    pub fn new(peer_fingerprint: Option<String>, capabilities: Capabilities) -> Self {
        Self {
            peer_fingerprint,
            capabilities,
        }
    }

    /// Hex SHA-256 of the peer's leaf certificate, if it presented one.
    pub fn peer_fingerprint(&self) -> Option<&str> {
        self.peer_fingerprint.as_deref()
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn has_capability(&self, name: &str) -> bool {
        match &self.capabilities {
            Capabilities::All => true,
            Capabilities::Set(set) => set.contains(name),
        }
    }

    pub fn has_all<S: AsRef<str>>(&self, names: &[S]) -> bool {
        names.iter().all(|n| self.has_capability(n.as_ref()))
    }
}

impl Default for AuthContext {
    fn default() -> Self {
        Self::unauthenticated()
    }
}

pub(crate) fn eof_error() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, constants::ERR_CONNECTION_EOF)
}

pub(crate) fn renegotiation_error() -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, constants::ERR_RENEGOTIATION)
}

/// Plain socket read: would-block is `Ok(0)`, end of stream is an error.
pub(crate) fn read_socket(io: &mut dyn Stream, dst: &mut [u8]) -> io::Result<usize> {
    loop {
        match io.read(dst) {
            Ok(0) if !dst.is_empty() => return Err(eof_error()),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Plain socket write: would-block is `Ok(0)`.
pub(crate) fn write_socket(io: &mut dyn Stream, src: &[u8]) -> io::Result<usize> {
    loop {
        match io.write(src) {
            Ok(0) if !src.is_empty() => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
}

/// Bytes read ahead of a decision, handed back before the socket is touched.
#[derive(Debug, Default)]
pub(crate) struct Replay {
    bytes: Vec<u8>,
    pos: usize,
}

impl Replay {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn read(&mut self, dst: &mut [u8]) -> usize {
        let left = &self.bytes[self.pos..];
        let n = left.len().min(dst.len());
        dst[..n].copy_from_slice(&left[..n]);
        self.pos += n;
        if self.pos == self.bytes.len() {
            self.bytes = Vec::new();
            self.pos = 0;
        }
        n
    }
}
