//! Listening sockets.
//!
//! Each [`Acceptor`] runs one thread blocked in `accept`. Accepted sockets are
//! made non-blocking and handed to a randomly chosen reactor.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::{ProtocolError, Result};
use crate::transport::spec::Spec;
use crate::transport::thread::panic_message;
use crate::transport::{FatalErrorHandler, TransportInner};

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Receives the sockets an acceptor thread accepts.
pub(crate) trait AcceptSink: Send + Sync {
    /// Take ownership of `stream`. `Err(Shutdown)` stops the acceptor.
    fn adopt(&self, stream: TcpStream, peer: SocketAddr) -> Result<()>;

    /// `accept` itself failed.
    fn accept_failed(&self);

    /// Whether anything is left to hand sockets to.
    fn is_live(&self) -> bool {
        true
    }
}

impl AcceptSink for Weak<TransportInner> {
    fn adopt(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let transport = self.upgrade().ok_or(ProtocolError::Shutdown)?;
        transport
            .adopt(stream, peer)
            .inspect_err(|_| transport.metrics().connection_error())
    }

    fn accept_failed(&self) {
        if let Some(transport) = self.upgrade() {
            transport.metrics().connection_error();
        }
    }

    fn is_live(&self) -> bool {
        self.strong_count() > 0
    }
}

/// A bound listening socket feeding accepted connections to a transport.
///
/// Dropping the acceptor stops listening; connections already accepted stay up.
#[derive(Debug)]
pub struct Acceptor {
    spec: Spec,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Acceptor {
    pub(crate) fn start(
        spec: &Spec,
        sink: Arc<dyn AcceptSink>,
        fatal: FatalErrorHandler,
    ) -> Result<Acceptor> {
        spec.check()?;
        let address = spec.listen_address();
        let listener =
            TcpListener::bind(&address).map_err(|e| ProtocolError::listen(spec, e))?;
        let local_addr = listener.local_addr()?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread_stop = stop.clone();
        let name = format!("reactor-rpc-acceptor-{}", local_addr.port());
        let join = thread::Builder::new().name(name.clone()).spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                accept_loop(&listener, sink.as_ref(), &thread_stop)
            }));
            if let Err(panic) = outcome {
                fatal(&format!("{name} panicked: {}", panic_message(panic.as_ref())));
            }
        })?;

        info!(address = %local_addr, "Listening");
        Ok(Acceptor {
            spec: spec.clone(),
            local_addr,
            stop,
            join: Mutex::new(Some(join)),
        })
    }

    /// The spec this acceptor was asked to listen on.
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Actual port bound, useful after listening on port 0.
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and wait for the accept thread to exit. Idempotent.
    pub fn shutdown(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        // unblock accept() with a throwaway connection
        let wake = wake_address(self.local_addr);
        if let Err(e) = TcpStream::connect_timeout(&wake, Duration::from_secs(1)) {
            debug!(address = %wake, error = %e, "Acceptor wakeup connect failed");
        }
        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                warn!(address = %self.local_addr, "Acceptor thread ended by a panic");
            }
        }
        debug!(address = %self.local_addr, "Acceptor stopped");
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn wake_address(local: SocketAddr) -> SocketAddr {
    match local.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), local.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), local.port())
        }
        _ => local,
    }
}

fn accept_loop(listener: &TcpListener, sink: &dyn AcceptSink, stop: &AtomicBool) {
    loop {
        let accepted = listener.accept();
        if stop.load(Ordering::Acquire) || !sink.is_live() {
            return;
        }
        match accepted {
            Ok((stream, peer)) => match sink.adopt(stream, peer) {
                Ok(()) => {}
                Err(ProtocolError::Shutdown) => return,
                Err(e) => warn!(peer = %peer, error = %e, "Failed to adopt accepted connection"),
            },
            Err(e) => {
                sink.accept_failed();
                warn!(error = %e, "Accept failed");
                // e.g. out of file descriptors; do not spin
                thread::sleep(ACCEPT_ERROR_BACKOFF);
            }
        }
    }
}
