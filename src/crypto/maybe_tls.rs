//! TLS or plaintext, decided per connection.
//!
//! Clients always speak TLS. A server socket reads the first [`SNOOP_SIZE`]
//! bytes, decides once whether they look like a TLS ClientHello, and hands them
//! to a TLS or a plaintext socket to be consumed as if freshly read.

use std::io;

use tracing::debug;

use super::null::NullCryptoSocket;
use super::tls::TlsCryptoEngine;
use super::{
    read_socket, AuthContext, CryptoEngine, CryptoSocket, FlushResult, HandshakeResult, Stream,
};
use crate::error::{ProtocolError, Result};
use crate::transport::spec::Spec;

/// Bytes inspected before deciding.
pub const SNOOP_SIZE: usize = 9;

const HANDSHAKE_RECORD: u8 = 22;
const CLIENT_HELLO: u8 = 1;
const MAX_RECORD: usize = 16 * 1024 + 2048;

/// Whether the first bytes of a stream look like a TLS record carrying a
/// ClientHello.
///
/// Checks record type, protocol major version, a plausible record length and
/// that the handshake message length fits the record exactly.
pub fn looks_like_tls(buf: &[u8; SNOOP_SIZE]) -> bool {
    let frame_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    let hello_len = u16::from_be_bytes([buf[7], buf[8]]) as usize;
    buf[0] == HANDSHAKE_RECORD
        && buf[1] == 3
        && buf[2] <= 4
        && frame_len < MAX_RECORD
        && buf[5] == CLIENT_HELLO
        && buf[6] == 0
        && hello_len + 4 == frame_len
}

/// Server socket that picks TLS or plaintext from the first bytes.
pub struct MaybeTlsCryptoSocket {
    engine: std::sync::Arc<TlsCryptoEngine>,
    snooped: [u8; SNOOP_SIZE],
    have: usize,
    inner: Option<Box<dyn CryptoSocket>>,
}

impl MaybeTlsCryptoSocket {
    fn new(engine: std::sync::Arc<TlsCryptoEngine>) -> Self {
        Self {
            engine,
            snooped: [0; SNOOP_SIZE],
            have: 0,
            inner: None,
        }
    }

    /// Whether the peer was detected as TLS; `None` until decided.
    pub fn is_tls(&self) -> Option<bool> {
        self.inner.as_ref().map(|_| looks_like_tls(&self.snooped))
    }

    fn decide(&mut self) -> io::Result<&mut Box<dyn CryptoSocket>> {
        let prefix = self.snooped.to_vec();
        let socket: Box<dyn CryptoSocket> = if looks_like_tls(&self.snooped) {
            debug!("Peer looks like TLS");
            let tls = self
                .engine
                .server_socket(&prefix)
                .map_err(|e| io::Error::other(e.to_string()))?;
            Box::new(tls)
        } else {
            debug!("Peer looks like plaintext");
            Box::new(NullCryptoSocket::with_replay(prefix))
        };
        Ok(self.inner.insert(socket))
    }
}

impl CryptoSocket for MaybeTlsCryptoSocket {
    fn handshake(&mut self, io: &mut dyn Stream) -> io::Result<HandshakeResult> {
        if let Some(inner) = self.inner.as_mut() {
            return inner.handshake(io);
        }
        while self.have < SNOOP_SIZE {
            let n = read_socket(io, &mut self.snooped[self.have..])?;
            if n == 0 {
                return Ok(HandshakeResult::NeedRead);
            }
            self.have += n;
        }
        self.decide()?.handshake(io)
    }

    fn do_handshake_work(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.do_handshake_work();
        }
    }

    fn min_read_buffer(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(SNOOP_SIZE, |inner| inner.min_read_buffer())
    }

    fn read(&mut self, io: &mut dyn Stream, dst: &mut [u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(inner) => inner.read(io, dst),
            None => Ok(0),
        }
    }

    fn drain(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(inner) => inner.drain(dst),
            None => Ok(0),
        }
    }

    fn write(&mut self, io: &mut dyn Stream, src: &[u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(inner) => inner.write(io, src),
            None => Ok(0),
        }
    }

    fn flush(&mut self, io: &mut dyn Stream) -> io::Result<FlushResult> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(io),
            None => Ok(FlushResult::Done),
        }
    }

    fn drop_empty_buffers(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.drop_empty_buffers();
        }
    }

    fn auth_context(&self) -> AuthContext {
        self.inner
            .as_ref()
            .map(|inner| inner.auth_context())
            .unwrap_or_default()
    }
}

/// TLS clients, auto-detecting servers.
pub struct MaybeTlsCryptoEngine {
    tls: std::sync::Arc<TlsCryptoEngine>,
}

impl MaybeTlsCryptoEngine {
    pub fn new(tls: TlsCryptoEngine) -> Self {
        Self {
            tls: std::sync::Arc::new(tls),
        }
    }
}

impl CryptoEngine for MaybeTlsCryptoEngine {
    fn create_client_crypto(&self, spec: &Spec) -> Result<Box<dyn CryptoSocket>> {
        self.tls.create_client_crypto(spec)
    }

    fn create_server_crypto(&self) -> Result<Box<dyn CryptoSocket>> {
        // fail at accept time rather than on the first ClientHello
        if !self.tls.can_serve() {
            return Err(ProtocolError::TlsError(
                "No server certificate configured".into(),
            ));
        }
        Ok(Box::new(MaybeTlsCryptoSocket::new(self.tls.clone())))
    }

    fn name(&self) -> &'static str {
        "maybe_tls"
    }
}
