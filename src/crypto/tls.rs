//! # TLS Crypto Engine
//!
//! TLS over rustls, driven step by step from the reactor.
//!
//! rustls does its record processing inside `process_new_packets`; that call is
//! what verifies certificates and runs key exchange, so every time fresh
//! handshake bytes arrive the socket reports `NeedWork` and the reactor hands
//! the call to the worker thread.
//!
//! ## Responsibilities
//! - Load certificates, keys and trust roots (PEM files or in-memory PEM)
//! - Build rustls client and server configurations, with optional mTLS
//! - Derive the peer's [`AuthContext`] from its certificate fingerprint

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;

use rustls::server::{AllowAnyAnonymousOrAuthenticatedClient, AllowAnyAuthenticatedClient};
use rustls::{
    Certificate, ClientConfig, ClientConnection, Connection, PrivateKey, RootCertStore,
    ServerConfig, ServerConnection, ServerName,
};
use rustls_pemfile::{certs, Item};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use super::{
    eof_error, renegotiation_error, AuthContext, Capabilities, CryptoEngine, CryptoSocket,
    FlushResult, HandshakeResult, Stream,
};
use crate::config::{CryptoConfig, PeerPolicy};
use crate::error::{constants, ProtocolError, Result};
use crate::transport::spec::Spec;

/// Largest TLS record plus header and expansion.
const MAX_RECORD: usize = 16 * 1024 + 2048;

/// Calculate the hex SHA-256 fingerprint of a DER certificate
pub fn fingerprint(cert: &Certificate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(&cert.0);
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

fn parse_certs(reader: &mut dyn BufRead, what: &str) -> Result<Vec<Certificate>> {
    let chain = certs(reader)
        .map_err(|_| ProtocolError::TlsError(format!("Failed to parse {what}")))?;
    if chain.is_empty() {
        return Err(ProtocolError::TlsError(format!("No {what} found")));
    }
    Ok(chain.into_iter().map(Certificate).collect())
}

fn parse_private_key(reader: &mut dyn BufRead) -> Result<PrivateKey> {
    let items = rustls_pemfile::read_all(reader)
        .map_err(|_| ProtocolError::TlsError("Failed to parse private key".into()))?;
    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::RSAKey(key) | Item::ECKey(key) => Some(PrivateKey(key)),
            _ => None,
        })
        .ok_or_else(|| ProtocolError::TlsError("No supported private key format found".into()))
}

fn open_pem(path: &str, what: &str) -> Result<BufReader<File>> {
    let file = File::open(path)
        .map_err(|e| ProtocolError::TlsError(format!("Failed to open {what} file {path}: {e}")))?;
    Ok(BufReader::new(file))
}

/// Certificates, keys, trust roots and peer policies for a TLS engine.
#[derive(Clone, Default)]
pub struct TlsConfig {
    cert_chain: Vec<Certificate>,
    private_key: Option<PrivateKey>,
    trusted: Vec<Certificate>,
    require_peer_cert: bool,
    server_name: Option<String>,
    peers: Vec<PeerPolicy>,
}

impl TlsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the PEM files named in a [`CryptoConfig`]
    pub fn from_crypto_config(config: &CryptoConfig) -> Result<Self> {
        let mut tls = Self::new();
        if let (Some(cert_path), Some(key_path)) = (&config.cert_path, &config.key_path) {
            tls.cert_chain = parse_certs(&mut open_pem(cert_path, "certificate")?, "certificate")?;
            tls.private_key = Some(parse_private_key(&mut open_pem(key_path, "key")?)?);
        }
        if let Some(ca_path) = &config.ca_path {
            tls.trusted = parse_certs(&mut open_pem(ca_path, "CA")?, "CA certificate")?;
        }
        tls.require_peer_cert = config.require_peer_cert;
        tls.server_name = config.server_name.clone();
        tls.peers = config.peers.clone();
        Ok(tls)
    }

    /// Certificate chain and key presented by this side
    pub fn with_identity_pem(mut self, cert_pem: &[u8], key_pem: &[u8]) -> Result<Self> {
        self.cert_chain = parse_certs(&mut io::Cursor::new(cert_pem), "certificate")?;
        self.private_key = Some(parse_private_key(&mut io::Cursor::new(key_pem))?);
        Ok(self)
    }

    /// Trust roots for verifying the peer
    pub fn with_trusted_pem(mut self, ca_pem: &[u8]) -> Result<Self> {
        self.trusted = parse_certs(&mut io::Cursor::new(ca_pem), "CA certificate")?;
        Ok(self)
    }

    /// Set whether peers must present a trusted certificate (servers only)
    pub fn require_peer_cert(mut self, required: bool) -> Self {
        self.require_peer_cert = required;
        self
    }

    /// SNI name to use instead of the host in the connect spec
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_peer_policy(mut self, policy: PeerPolicy) -> Self {
        self.peers.push(policy);
        self
    }

    fn root_store(&self) -> Result<RootCertStore> {
        let mut store = RootCertStore::empty();
        for cert in &self.trusted {
            store
                .add(cert)
                .map_err(|e| ProtocolError::TlsError(format!("Failed to add CA cert: {e}")))?;
        }
        Ok(store)
    }

    /// Server configuration, or `None` without a certificate and key
    pub fn load_server_config(&self) -> Result<Option<ServerConfig>> {
        let Some(key) = self.private_key.clone() else {
            return Ok(None);
        };
        let builder = ServerConfig::builder().with_safe_defaults();

        let builder = if self.trusted.is_empty() {
            builder.with_no_client_auth()
        } else if self.require_peer_cert {
            debug!("mTLS enabled with client certificate verification required");
            builder.with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(
                self.root_store()?,
            )))
        } else {
            builder.with_client_cert_verifier(Arc::new(
                AllowAnyAnonymousOrAuthenticatedClient::new(self.root_store()?),
            ))
        };

        let config = builder
            .with_single_cert(self.cert_chain.clone(), key)
            .map_err(|e| ProtocolError::TlsError(format!("TLS error: {e}")))?;
        Ok(Some(config))
    }

    /// Client configuration, or `None` without trust roots
    pub fn load_client_config(&self) -> Result<Option<ClientConfig>> {
        if self.trusted.is_empty() {
            return Ok(None);
        }
        let builder = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(self.root_store()?);

        let config = match &self.private_key {
            Some(key) => builder
                .with_client_auth_cert(self.cert_chain.clone(), key.clone())
                .map_err(|e| {
                    ProtocolError::TlsError(format!("Failed to set client certificate: {e}"))
                })?,
            None => builder.with_no_client_auth(),
        };
        Ok(Some(config))
    }
}

/// Capability grants keyed by certificate fingerprint.
#[derive(Debug, Default)]
pub(crate) struct PeerPolicies {
    grants: HashMap<String, HashSet<String>>,
}

impl PeerPolicies {
    fn new(policies: &[PeerPolicy]) -> Self {
        let grants = policies
            .iter()
            .map(|p| {
                (
                    p.fingerprint.to_ascii_lowercase(),
                    p.capabilities.iter().cloned().collect(),
                )
            })
            .collect();
        Self { grants }
    }

    fn auth_for(&self, peer_certs: Option<&[Certificate]>) -> AuthContext {
        let peer = peer_certs.and_then(|chain| chain.first()).map(fingerprint);
        if self.grants.is_empty() {
            return AuthContext::new(peer, Capabilities::All);
        }
        let granted = peer
            .as_ref()
            .and_then(|fp| self.grants.get(fp))
            .cloned()
            .unwrap_or_default();
        AuthContext::new(peer, Capabilities::Set(granted))
    }
}

fn tls_failure(err: rustls::Error) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("{}: {err}", constants::ERR_HANDSHAKE_FAILED),
    )
}

/// One TLS session.
pub struct TlsCryptoSocket {
    conn: Connection,
    work_pending: bool,
    work_error: Option<io::Error>,
    done: bool,
    auth: AuthContext,
    policies: Arc<PeerPolicies>,
}

impl TlsCryptoSocket {
    fn new(conn: Connection, policies: Arc<PeerPolicies>) -> Self {
        Self {
            conn,
            work_pending: false,
            work_error: None,
            done: false,
            auth: AuthContext::unauthenticated(),
            policies,
        }
    }

    fn write_pending(&mut self, io: &mut dyn Stream) -> io::Result<FlushResult> {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut &mut *io) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(FlushResult::NeedWrite)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(FlushResult::Done)
    }
}

impl CryptoSocket for TlsCryptoSocket {
    fn handshake(&mut self, io: &mut dyn Stream) -> io::Result<HandshakeResult> {
        if self.done {
            return Err(renegotiation_error());
        }
        if let Some(err) = self.work_error.take() {
            return Err(err);
        }
        loop {
            if self.write_pending(io)? == FlushResult::NeedWrite {
                return Ok(HandshakeResult::NeedWrite);
            }
            if self.work_pending {
                return Ok(HandshakeResult::NeedWork);
            }
            if !self.conn.is_handshaking() {
                self.done = true;
                self.auth = self.policies.auth_for(self.conn.peer_certificates());
                return Ok(HandshakeResult::Done);
            }
            match self.conn.read_tls(&mut &mut *io) {
                Ok(0) => return Err(eof_error()),
                Ok(_) => self.work_pending = true,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(HandshakeResult::NeedRead)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn do_handshake_work(&mut self) {
        self.work_pending = false;
        match self.conn.process_new_packets() {
            Ok(state) if self.conn.is_handshaking() && state.plaintext_bytes_to_read() > 0 => {
                self.work_error = Some(io::Error::new(
                    io::ErrorKind::InvalidData,
                    constants::ERR_HANDSHAKE_DATA,
                ));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "TLS handshake failed");
                self.work_error = Some(tls_failure(e));
            }
        }
    }

    fn min_read_buffer(&self) -> usize {
        MAX_RECORD
    }

    fn read(&mut self, io: &mut dyn Stream, dst: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.conn.reader().read(dst) {
                Ok(0) if !dst.is_empty() => return Err(eof_error()),
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
            match self.conn.read_tls(&mut &mut *io) {
                Ok(0) => return Err(eof_error()),
                Ok(_) => {
                    self.conn.process_new_packets().map_err(tls_failure)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    fn drain(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        match self.conn.reader().read(dst) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, io: &mut dyn Stream, src: &[u8]) -> io::Result<usize> {
        if self.write_pending(io)? == FlushResult::NeedWrite {
            return Ok(0);
        }
        let n = self.conn.writer().write(src)?;
        self.write_pending(io)?;
        Ok(n)
    }

    fn flush(&mut self, io: &mut dyn Stream) -> io::Result<FlushResult> {
        self.write_pending(io)
    }

    fn auth_context(&self) -> AuthContext {
        self.auth.clone()
    }
}

/// Engine producing [`TlsCryptoSocket`]s.
pub struct TlsCryptoEngine {
    server: Option<Arc<ServerConfig>>,
    client: Option<Arc<ClientConfig>>,
    server_name: Option<String>,
    policies: Arc<PeerPolicies>,
}

impl TlsCryptoEngine {
    /// Build client and server configurations; at least one must be possible.
    pub fn new(config: TlsConfig) -> Result<Self> {
        let server = config.load_server_config()?.map(Arc::new);
        let client = config.load_client_config()?.map(Arc::new);
        if server.is_none() && client.is_none() {
            return Err(ProtocolError::TlsError(
                "TLS needs a certificate and key, trusted CA certificates, or both".into(),
            ));
        }
        Ok(Self {
            server,
            client,
            server_name: config.server_name,
            policies: Arc::new(PeerPolicies::new(&config.peers)),
        })
    }

    pub(crate) fn can_serve(&self) -> bool {
        self.server.is_some()
    }

    /// Server session that first consumes `prefix`, already read off the stream.
    pub(crate) fn server_socket(&self, prefix: &[u8]) -> Result<TlsCryptoSocket> {
        let config = self.server.clone().ok_or_else(|| {
            ProtocolError::TlsError("No server certificate configured".into())
        })?;
        let conn = ServerConnection::new(config)?;
        let mut socket = TlsCryptoSocket::new(Connection::from(conn), self.policies.clone());
        if !prefix.is_empty() {
            socket.conn.read_tls(&mut &prefix[..])?;
            socket.work_pending = true;
        }
        Ok(socket)
    }
}

impl CryptoEngine for TlsCryptoEngine {
    fn create_client_crypto(&self, spec: &Spec) -> Result<Box<dyn CryptoSocket>> {
        let config = self.client.clone().ok_or_else(|| {
            ProtocolError::TlsError("No trusted CA certificates configured".into())
        })?;
        let host = self.server_name.as_deref().unwrap_or(spec.connect_host());
        let name = ServerName::try_from(host)
            .map_err(|_| ProtocolError::TlsError(format!("Invalid server name: {host}")))?;
        let conn = ClientConnection::new(config, name)?;
        Ok(Box::new(TlsCryptoSocket::new(
            Connection::from(conn),
            self.policies.clone(),
        )))
    }

    fn create_server_crypto(&self) -> Result<Box<dyn CryptoSocket>> {
        Ok(Box::new(self.server_socket(&[])?))
    }

    fn name(&self) -> &'static str {
        "tls"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testing::{pair, test_pki, MemStream};

    fn engines(require_client: bool) -> (TlsCryptoEngine, TlsCryptoEngine, String) {
        let pki = test_pki();
        let server = TlsConfig::new()
            .with_identity_pem(pki.server_cert.as_bytes(), pki.server_key.as_bytes())
            .and_then(|c| c.with_trusted_pem(pki.ca_cert.as_bytes()))
            .expect("server pem")
            .require_peer_cert(require_client)
            .with_peer_policy(PeerPolicy {
                fingerprint: pki.client_fingerprint.clone(),
                capabilities: vec!["admin".into()],
            });
        let client = TlsConfig::new()
            .with_identity_pem(pki.client_cert.as_bytes(), pki.client_key.as_bytes())
            .and_then(|c| c.with_trusted_pem(pki.ca_cert.as_bytes()))
            .expect("client pem");
        (
            TlsCryptoEngine::new(server).expect("server engine"),
            TlsCryptoEngine::new(client).expect("client engine"),
            pki.client_fingerprint,
        )
    }

    fn step(sock: &mut dyn CryptoSocket, io: &mut MemStream) -> HandshakeResult {
        loop {
            match sock.handshake(io).expect("handshake") {
                HandshakeResult::NeedWork => sock.do_handshake_work(),
                other => return other,
            }
        }
    }

    fn connect(
        client: &mut dyn CryptoSocket,
        a: &mut MemStream,
        server: &mut dyn CryptoSocket,
        b: &mut MemStream,
    ) {
        let (mut c_done, mut s_done) = (false, false);
        for _ in 0..20 {
            if !c_done {
                c_done = step(client, a) == HandshakeResult::Done;
            }
            if !s_done {
                s_done = step(server, b) == HandshakeResult::Done;
            }
            if c_done && s_done {
                return;
            }
        }
        panic!("handshake did not finish");
    }

    #[test]
    fn test_mutual_tls_roundtrip_and_capabilities() {
        let (server_engine, client_engine, client_fp) = engines(true);
        let (mut a, mut b) = pair();
        let mut client = client_engine
            .create_client_crypto(&Spec::parse("tcp/localhost:1"))
            .expect("client");
        let mut server = server_engine.create_server_crypto().expect("server");
        connect(client.as_mut(), &mut a, server.as_mut(), &mut b);

        let auth = server.auth_context();
        assert_eq!(auth.peer_fingerprint(), Some(client_fp.as_str()));
        assert!(auth.has_capability("admin"));
        assert!(!auth.has_capability("root"));

        assert_eq!(client.write(&mut a, b"hello").expect("write"), 5);
        assert_eq!(client.flush(&mut a).expect("flush"), FlushResult::Done);
        let mut buf = vec![0u8; server.min_read_buffer()];
        let mut got = Vec::new();
        while got.len() < 5 {
            let n = server.read(&mut b, &mut buf).expect("read");
            assert!(n > 0, "plaintext should be available");
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"hello");
        assert_eq!(server.read(&mut b, &mut buf).expect("quiet"), 0);
        assert!(server.handshake(&mut b).is_err());
    }

    #[test]
    fn test_untrusted_server_fails_handshake() {
        let (server_engine, _, _) = engines(false);
        let other = test_pki();
        let client_engine = TlsCryptoEngine::new(
            TlsConfig::new()
                .with_trusted_pem(other.ca_cert.as_bytes())
                .expect("pem"),
        )
        .expect("engine");

        let (mut a, mut b) = pair();
        let mut client = client_engine
            .create_client_crypto(&Spec::parse("tcp/localhost:1"))
            .expect("client");
        let mut server = server_engine.create_server_crypto().expect("server");

        let mut failed = false;
        for _ in 0..10 {
            let results = [
                drive_once(client.as_mut(), &mut a),
                drive_once(server.as_mut(), &mut b),
            ];
            if results.iter().any(|r| r.is_err()) {
                failed = true;
                break;
            }
        }
        assert!(failed);
    }

    fn drive_once(sock: &mut dyn CryptoSocket, io: &mut MemStream) -> io::Result<HandshakeResult> {
        loop {
            match sock.handshake(io)? {
                HandshakeResult::NeedWork => sock.do_handshake_work(),
                other => return Ok(other),
            }
        }
    }

    #[test]
    fn test_engine_needs_some_material() {
        assert!(TlsCryptoEngine::new(TlsConfig::new()).is_err());
    }

    #[test]
    fn test_no_policies_grants_everything() {
        let policies = PeerPolicies::new(&[]);
        assert!(policies.auth_for(None).has_capability("anything"));
    }
}
