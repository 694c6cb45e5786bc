//! Helpers shared by the integration tests.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use reactor_rpc::config::TransportConfig;
use reactor_rpc::crypto::CryptoEngine;
use reactor_rpc::protocol::{Method, Request, Supervisor};
use reactor_rpc::transport::{Acceptor, TransportBuilder};
use reactor_rpc::Spec;

pub const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Small tick so timeouts resolve quickly.
pub fn fast_config() -> TransportConfig {
    TransportConfig {
        threads: 2,
        tick: Duration::from_millis(10),
        connect_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn supervisor(config: TransportConfig, crypto: Option<Arc<dyn CryptoEngine>>) -> Supervisor {
    let mut builder = TransportBuilder::new().config(config);
    if let Some(crypto) = crypto {
        builder = builder.crypto_engine(crypto);
    }
    Supervisor::with_builder(builder).expect("supervisor")
}

pub fn plain_supervisor() -> Supervisor {
    supervisor(fast_config(), None)
}

/// Echo method registered under `echo`.
pub fn echo_method() -> Method {
    Method::new("echo", "*", "*", |req: &mut Request| {
        let params = req.params().clone();
        *req.returns_mut() = params;
    })
    .describe("Return the parameters unchanged")
}

pub fn listen_local(server: &Supervisor) -> Acceptor {
    server.listen(&Spec::parse("tcp/127.0.0.1:0")).expect("listen")
}

pub fn local_spec(acceptor: &Acceptor) -> Spec {
    Spec::from_host_port("127.0.0.1", acceptor.local_port())
}

/// Poll `cond` until it holds or `limit` passes.
pub fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Throwaway CA plus a server and a client certificate signed by it.
pub struct Pki {
    pub ca_cert: String,
    pub server_cert: String,
    pub server_key: String,
    pub client_cert: String,
    pub client_key: String,
    pub client_fingerprint: String,
}

pub fn pki() -> Pki {
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};

    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::new(Vec::<String>::new()).unwrap();
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params
        .distinguished_name
        .push(DnType::CommonName, "reactor-rpc integration ca");
    let ca = ca_params.self_signed(&ca_key).unwrap();

    let leaf = |name: &str| {
        let key = KeyPair::generate().unwrap();
        let params = CertificateParams::new(vec![name.to_string()]).unwrap();
        let cert = params.signed_by(&key, &ca, &ca_key).unwrap();
        (cert, key)
    };
    let (server, server_key) = leaf("localhost");
    let (client, client_key) = leaf("client.local");

    Pki {
        ca_cert: ca.pem(),
        server_cert: server.pem(),
        server_key: server_key.serialize_pem(),
        client_fingerprint: reactor_rpc::crypto::tls::fingerprint(&rustls::Certificate(
            client.der().to_vec(),
        )),
        client_cert: client.pem(),
        client_key: client_key.serialize_pem(),
    }
}
