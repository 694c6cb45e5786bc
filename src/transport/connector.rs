//! Outbound connection setup.
//!
//! Name resolution and the TCP connect run on a small tokio runtime so a slow
//! DNS answer or an unreachable host never stalls a reactor or the caller of
//! [`Transport::connect`](crate::transport::Transport::connect). The connected
//! socket is then converted into a non-blocking mio stream and handed to its
//! reactor.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use crate::crypto::CryptoSocket;
use crate::error::Result;
use crate::transport::connection::{Connection, ConnectionShared};
use crate::transport::thread::Command;
use crate::utils::metrics::TransportMetrics;

/// One pending outbound connection.
pub(crate) struct ConnectRequest {
    pub shared: Arc<ConnectionShared>,
    pub crypto: Box<dyn CryptoSocket>,
    pub tcp_no_delay: bool,
    pub metrics: Arc<TransportMetrics>,
}

pub(crate) struct Connector {
    runtime: Mutex<Option<Runtime>>,
    timeout: Duration,
}

impl Connector {
    pub(crate) fn new(threads: usize, timeout: Duration) -> Result<Connector> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("reactor-rpc-connector")
            .enable_all()
            .build()?;
        Ok(Connector {
            runtime: Mutex::new(Some(runtime)),
            timeout,
        })
    }

    /// Start connecting in the background. Returns `false` after shutdown.
    pub(crate) fn connect(&self, request: ConnectRequest) -> bool {
        let guard = self.runtime.lock();
        let Some(runtime) = guard.as_ref() else {
            return false;
        };
        let timeout = self.timeout;
        let mut pending = PendingConnect(Some(request.shared.clone()));
        runtime.spawn(async move {
            let ConnectRequest {
                shared,
                crypto,
                tcp_no_delay,
                metrics,
            } = request;
            let address = shared.spec().connect_address();
            match establish(&address, tcp_no_delay, timeout).await {
                Ok(stream) => {
                    debug!(address = %address, "Connected");
                    let conn = Connection::new(shared.clone(), stream, crypto);
                    if shared.owner().post(Command::Add(Box::new(conn))).is_ok() {
                        pending.0 = None;
                    }
                }
                Err(e) => {
                    warn!(address = %address, error = %e, "Connect failed");
                    metrics.connection_error();
                }
            }
        });
        true
    }

    /// Abandon in-flight attempts; their connections close as they are dropped.
    pub(crate) fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
    }
}

/// Closes the connection unless it reached a reactor, including when the task
/// is dropped by a runtime shutdown.
struct PendingConnect(Option<Arc<ConnectionShared>>);

impl Drop for PendingConnect {
    fn drop(&mut self) {
        if let Some(shared) = self.0.take() {
            shared.mark_closed();
        }
    }
}

async fn establish(
    address: &str,
    tcp_no_delay: bool,
    timeout: Duration,
) -> io::Result<mio::net::TcpStream> {
    let stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(tcp_no_delay)?;
    // into_std leaves the socket in non-blocking mode, as mio requires
    let stream = stream.into_std()?;
    Ok(mio::net::TcpStream::from_std(stream))
}
