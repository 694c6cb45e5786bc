//! Client-side handle to a connection.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::bounded;

use crate::crypto::AuthContext;
use crate::protocol::invocation::{self, PendingRequest};
use crate::protocol::request::{ErrorCode, Request};
use crate::transport::spec::Spec;
use crate::transport::{ConnectionShared, ConnectionState, ConnectionWatcher};

/// Told once when a target's connection closes.
pub trait TargetWatcher: Send + Sync {
    fn target_closed(&self, target: &Target);
}

impl<W: TargetWatcher> ConnectionWatcher for W {
    fn connection_closed(&self, conn: &Arc<ConnectionShared>) {
        self.target_closed(&Target::new(conn.clone()));
    }
}

/// A peer to invoke methods on. Cheap to clone; clones share the connection.
#[derive(Debug, Clone)]
pub struct Target {
    conn: Arc<ConnectionShared>,
}

impl Target {
    pub fn new(conn: Arc<ConnectionShared>) -> Self {
        Self { conn }
    }

    /// Invoke and block the calling thread until the request completes.
    ///
    /// Must not be called from a reactor thread; doing so fails the request
    /// immediately with [`ErrorCode::GENERAL_ERROR`].
    pub fn invoke_sync(&self, mut request: Request, timeout: Duration) -> Request {
        if self.conn.owner().is_current() {
            request.set_error(
                ErrorCode::GENERAL_ERROR,
                "Synchronous invocation from a reactor thread",
            );
            return request;
        }
        let method = request.method_name().to_string();
        let (tx, rx) = bounded(1);
        invocation::invoke(
            &self.conn,
            request,
            timeout,
            Box::new(move |done| {
                let _ = tx.send(done);
            }),
        );
        rx.recv().unwrap_or_else(|_| {
            let mut lost = Request::new(method);
            lost.set_error_code(ErrorCode::CONNECTION);
            lost
        })
    }

    /// Invoke and call `done` with the finished request, on whichever thread
    /// completes it.
    pub fn invoke_async<F>(&self, request: Request, timeout: Duration, done: F) -> PendingRequest
    where
        F: FnOnce(Request) + Send + 'static,
    {
        invocation::invoke(&self.conn, request, timeout, Box::new(done))
    }

    /// Fire and forget. Returns `false` if the connection is already closed.
    pub fn invoke_void(&self, request: Request) -> bool {
        invocation::invoke_void(&self.conn, request)
    }

    pub fn is_valid(&self) -> bool {
        self.conn.is_valid()
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    pub fn spec(&self) -> &Spec {
        self.conn.spec()
    }

    pub fn auth_context(&self) -> AuthContext {
        self.conn.auth_context()
    }

    pub fn close(&self) {
        self.conn.close();
    }

    /// Watch for the connection closing; `false` if it already has.
    pub fn add_watcher<W: TargetWatcher + 'static>(&self, watcher: Arc<W>) -> bool {
        self.conn.add_watcher(watcher)
    }

    pub fn remove_watcher<W: TargetWatcher + 'static>(&self, watcher: &Arc<W>) -> bool {
        let watcher: Arc<dyn ConnectionWatcher> = watcher.clone();
        self.conn.remove_watcher(&watcher)
    }

    pub fn connection(&self) -> &Arc<ConnectionShared> {
        &self.conn
    }
}

impl From<Arc<ConnectionShared>> for Target {
    fn from(conn: Arc<ConnectionShared>) -> Self {
        Self::new(conn)
    }
}
