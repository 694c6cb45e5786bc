//! # Transport
//!
//! Moves packets between this process and its peers over persistent TCP
//! connections.
//!
//! A [`Transport`] runs a fixed pool of reactor threads. Every connection is
//! pinned to one of them for its whole life; the reactor does all socket I/O,
//! the crypto handshake, framing and dispatch for it. Around the reactors:
//!
//! - a connector resolving and connecting outbound sockets without blocking
//!   anyone,
//! - one [`Acceptor`] thread per listening socket,
//! - a worker thread for CPU-heavy handshake steps and for closing sockets.
//!
//! Inbound requests go to the [`RequestDispatcher`] given at construction;
//! replies are matched to their waiting handler by request id.
//!
//! ## Example
//! ```rust,no_run
//! use std::sync::Arc;
//! use reactor_rpc::config::TransportConfig;
//! use reactor_rpc::crypto::null::NullCryptoEngine;
//! use reactor_rpc::transport::{spec::Spec, Transport};
//!
//! # fn main() -> reactor_rpc::error::Result<()> {
//! let transport = Transport::builder()
//!     .config(TransportConfig::default())
//!     .crypto_engine(Arc::new(NullCryptoEngine))
//!     .build()?;
//! let acceptor = transport.listen(&Spec::from_port(0))?;
//! let conn = transport.connect(&Spec::from_port(acceptor.local_port()))?;
//! assert!(conn.is_valid());
//! transport.shutdown(true);
//! # Ok(())
//! # }
//! ```

pub mod acceptor;
pub mod connection;
mod connector;
pub mod spec;
pub(crate) mod thread;
mod worker;

pub use acceptor::Acceptor;
pub use connection::{
    ConnectionShared, ConnectionState, ConnectionWatcher, ReplyEvent, ReplyHandler,
};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, error, info};

use crate::config::TransportConfig;
use crate::core::packet::{Packet, PacketBody, FLAG_REVERSE};
use crate::crypto::null::NullCryptoEngine;
use crate::crypto::CryptoEngine;
use crate::error::{ProtocolError, Result};
use crate::protocol::request::ErrorCode;
use crate::utils::metrics::{MetricsSnapshot, TransportMetrics};
use connection::{Connection, ConnectionSettings};
use connector::{ConnectRequest, Connector};
use spec::Spec;
pub(crate) use thread::panic_message;
use thread::{Command, CryptoRelease, ReactorEnv, ReactorHandle, TransportThread};
use worker::Worker;

/// Receives every inbound Request packet, on the reactor thread owning `conn`.
///
/// Implementations must not block; long work belongs on another thread with
/// the reply posted back through `conn`.
pub trait RequestDispatcher: Send + Sync {
    fn dispatch(&self, conn: &Arc<ConnectionShared>, packet: Packet);
}

/// Called when a transport thread dies from an unrecoverable error.
pub type FatalErrorHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Logs the error and aborts the process.
pub fn abort_on_fatal_error() -> FatalErrorHandler {
    Arc::new(|msg: &str| {
        error!(error = msg, "Fatal transport error");
        std::process::abort();
    })
}

/// Answers every request with [`ErrorCode::NO_SUCH_METHOD`].
struct NoMethods;

impl RequestDispatcher for NoMethods {
    fn dispatch(&self, conn: &Arc<ConnectionShared>, packet: Packet) {
        if packet.is_noreply() {
            return;
        }
        if let PacketBody::Request { method, .. } = &packet.body {
            debug!(method = %method, "No dispatcher installed");
        }
        let reply = Packet::error(
            packet.request_id,
            ErrorCode::NO_SUCH_METHOD,
            ErrorCode::message(ErrorCode::NO_SUCH_METHOD),
        )
        .with_flags(packet.flags & FLAG_REVERSE);
        conn.post_packet(reply, None);
    }
}

/// Builder for [`Transport`].
pub struct TransportBuilder {
    config: TransportConfig,
    crypto: Option<Arc<dyn CryptoEngine>>,
    dispatcher: Option<Arc<dyn RequestDispatcher>>,
    fatal: Option<FatalErrorHandler>,
}

impl TransportBuilder {
    pub fn new() -> Self {
        Self {
            config: TransportConfig::default(),
            crypto: None,
            dispatcher: None,
            fatal: None,
        }
    }

    pub fn config(mut self, config: TransportConfig) -> Self {
        self.config = config;
        self
    }

    /// Crypto for every connection; plaintext if unset.
    pub fn crypto_engine(mut self, engine: Arc<dyn CryptoEngine>) -> Self {
        self.crypto = Some(engine);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn RequestDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Replace the default fatal error handler, which aborts the process.
    pub fn fatal_error_handler(mut self, handler: FatalErrorHandler) -> Self {
        self.fatal = Some(handler);
        self
    }

    /// Validate the configuration and start every thread.
    pub fn build(self) -> Result<Transport> {
        let errors = self.config.validate();
        if !errors.is_empty() {
            return Err(ProtocolError::ConfigError(errors.join("; ")));
        }
        let config = self.config;
        let crypto = self.crypto.unwrap_or_else(|| Arc::new(NullCryptoEngine));
        let fatal = self.fatal.unwrap_or_else(abort_on_fatal_error);
        let metrics = Arc::new(TransportMetrics::new());
        let settings = Arc::new(ConnectionSettings::from(&config));

        let worker = Worker::start(config.worker_queue_size, fatal.clone())?;
        let connector = match Connector::new(config.connector_threads, config.connect_timeout) {
            Ok(connector) => connector,
            Err(e) => {
                worker.shutdown();
                return Err(e);
            }
        };

        let env = ReactorEnv {
            settings: settings.clone(),
            worker: worker.clone(),
            dispatcher: self.dispatcher.unwrap_or_else(|| Arc::new(NoMethods)),
            metrics: metrics.clone(),
            fatal: fatal.clone(),
            crypto: Arc::new(CryptoRelease(crypto.clone())),
        };
        let mut threads = Vec::with_capacity(config.threads);
        for index in 0..config.threads {
            match TransportThread::spawn(index, config.tick, env.clone()) {
                Ok(thread) => threads.push(thread),
                Err(e) => {
                    for thread in &threads {
                        thread.handle().shutdown();
                        thread.join();
                    }
                    connector.shutdown();
                    worker.shutdown();
                    return Err(e);
                }
            }
        }
        drop(env);

        info!(
            threads = config.threads,
            crypto = crypto.name(),
            tick_ms = config.tick.as_millis() as u64,
            "Transport started"
        );
        Ok(Transport {
            inner: Arc::new(TransportInner {
                config,
                settings,
                threads,
                worker,
                connector,
                crypto,
                metrics,
                fatal,
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

impl Default for TransportBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct TransportInner {
    config: TransportConfig,
    settings: Arc<ConnectionSettings>,
    threads: Vec<TransportThread>,
    worker: Arc<Worker>,
    connector: Connector,
    crypto: Arc<dyn CryptoEngine>,
    metrics: Arc<TransportMetrics>,
    fatal: FatalErrorHandler,
    shut_down: AtomicBool,
}

impl TransportInner {
    pub(crate) fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    fn pick_reactor(&self) -> &Arc<ReactorHandle> {
        let index = rand::rng().random_range(0..self.threads.len());
        self.threads[index].handle()
    }

    /// Hand an accepted socket to a reactor.
    pub(crate) fn adopt(&self, stream: std::net::TcpStream, peer: SocketAddr) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ProtocolError::Shutdown);
        }
        stream.set_nonblocking(true)?;
        stream.set_nodelay(self.settings.tcp_no_delay)?;
        let crypto = self.crypto.create_server_crypto()?;
        let reactor = self.pick_reactor();
        let spec = Spec::from_host_port(peer.ip().to_string(), peer.port());
        let shared = ConnectionShared::new(reactor.clone(), spec, true, self.metrics.clone());
        let conn = Connection::new(shared, mio::net::TcpStream::from_std(stream), crypto);
        reactor
            .post(Command::Add(Box::new(conn)))
            .map_err(|_| ProtocolError::Shutdown)
    }

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Transport shutting down");
        self.connector.shutdown();
        for thread in &self.threads {
            thread.handle().shutdown();
        }
    }

    fn join(&self) {
        for thread in &self.threads {
            thread.join();
        }
        if !self.threads.iter().any(|t| t.handle().is_current()) {
            self.worker.shutdown();
        }
    }
}

/// Handle to a running transport. Dropping it shuts the transport down.
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub fn builder() -> TransportBuilder {
        TransportBuilder::new()
    }

    /// Start connecting to `spec`. Never blocks on the network.
    ///
    /// Only a malformed spec or a crypto setup failure is reported here; a
    /// connection that cannot be established closes, failing anything sent on it.
    pub fn connect(&self, spec: &Spec) -> Result<Arc<ConnectionShared>> {
        spec.check()?;
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(ProtocolError::Shutdown);
        }
        let crypto = self.inner.crypto.create_client_crypto(spec)?;
        let reactor = self.inner.pick_reactor();
        let shared = ConnectionShared::new(
            reactor.clone(),
            spec.clone(),
            false,
            self.inner.metrics.clone(),
        );
        shared.advance(ConnectionState::Connecting);
        let started = self.inner.connector.connect(ConnectRequest {
            shared: shared.clone(),
            crypto,
            tcp_no_delay: self.inner.settings.tcp_no_delay,
            metrics: self.inner.metrics.clone(),
        });
        if !started {
            shared.mark_closed();
        }
        Ok(shared)
    }

    /// Bind and start accepting on `spec`.
    pub fn listen(&self, spec: &Spec) -> Result<Acceptor> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(ProtocolError::Shutdown);
        }
        Acceptor::start(
            spec,
            Arc::new(Arc::downgrade(&self.inner)),
            self.inner.fatal.clone(),
        )
    }

    /// Block until every reactor has run all commands posted before this call.
    pub fn sync(&self) {
        for thread in &self.inner.threads {
            thread.handle().sync();
        }
    }

    /// Stop all threads, closing every connection. With `wait`, also join them.
    ///
    /// Each reactor closes its connections as soon as it sees the shutdown
    /// command; packets still queued for sending are dropped and pending
    /// requests fail with [`ErrorCode::CONNECTION`].
    pub fn shutdown(&self, wait: bool) {
        self.inner.shutdown();
        if wait {
            self.inner.join();
        }
    }

    /// Wait for all threads to exit after [`Transport::shutdown`].
    pub fn join(&self) {
        self.inner.join();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn crypto_engine(&self) -> &Arc<dyn CryptoEngine> {
        &self.inner.crypto
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    /// Log a metrics summary at info level.
    pub fn log_metrics(&self) {
        self.inner.metrics.log_metrics();
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.shutdown(true);
    }
}
