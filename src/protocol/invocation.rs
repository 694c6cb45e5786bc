//! # Client-side invocations
//!
//! An invocation ends in exactly one of four ways: a reply (or error packet)
//! arrives, the timeout fires, the connection goes down, or the caller aborts.
//! These race on different threads; an atomic flag lets the first one win and
//! turns the rest into no-ops. Whoever wins cancels the timeout, forgets the
//! reply handler and hands the finished [`Request`] to the caller's callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::core::packet::{Packet, PacketBody, FLAG_NOREPLY};
use crate::protocol::request::{ErrorCode, Request};
use crate::transport::{ConnectionShared, ReplyEvent};
use crate::utils::scheduler::Task;

/// Receives the finished request.
pub type RequestCallback = Box<dyn FnOnce(Request) + Send>;

struct InvocationState {
    done: AtomicBool,
    conn: Arc<ConnectionShared>,
    request_id: u32,
    request: Mutex<Option<Request>>,
    callback: Mutex<Option<RequestCallback>>,
    timeout: Mutex<Option<Task>>,
}

impl InvocationState {
    /// Finish the invocation unless something else already did.
    fn complete<F>(&self, fill: F) -> bool
    where
        F: FnOnce(&mut Request),
    {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        // dropping the task kills it
        drop(self.timeout.lock().take());
        drop(self.conn.take_reply(self.request_id));
        let request = self.request.lock().take();
        let callback = self.callback.lock().take();
        if let (Some(mut request), Some(callback)) = (request, callback) {
            fill(&mut request);
            callback(request);
        }
        true
    }

    fn on_reply(&self, event: ReplyEvent) {
        match event {
            ReplyEvent::Packet(packet) => {
                let request_id = packet.request_id;
                self.complete(|req| match packet.body {
                    PacketBody::Reply { values } => req.set_returns(values),
                    PacketBody::Error { code, message } => req.set_error(code, message),
                    PacketBody::Request { .. } => {
                        debug!(request_id, "Request packet arrived as an answer");
                        req.set_error_code(ErrorCode::BAD_REPLY)
                    }
                });
            }
            ReplyEvent::ConnectionDown => {
                self.complete(|req| req.set_error_code(ErrorCode::CONNECTION));
            }
        }
    }

    fn on_timeout(&self) {
        if self.complete(|req| req.set_error_code(ErrorCode::TIMEOUT)) {
            self.conn.metrics().timeout();
            trace!(request_id = self.request_id, "Request timed out");
        }
    }
}

/// Handle to an invocation in flight.
pub struct PendingRequest {
    state: Arc<InvocationState>,
}

impl PendingRequest {
    /// Complete the request with [`ErrorCode::ABORT`].
    ///
    /// Returns `false` if it had already completed; the callback then saw the
    /// real outcome instead.
    pub fn abort(&self) -> bool {
        self.state
            .complete(|req| req.set_error_code(ErrorCode::ABORT))
    }

    pub fn is_done(&self) -> bool {
        self.state.done.load(Ordering::Acquire)
    }

    pub fn request_id(&self) -> u32 {
        self.state.request_id
    }
}

/// Send `request` on `conn` and call `callback` with the outcome.
pub(crate) fn invoke(
    conn: &Arc<ConnectionShared>,
    mut request: Request,
    timeout: Duration,
    callback: RequestCallback,
) -> PendingRequest {
    request.reset();
    let request_id = conn.allocate_request_id();
    let packet = Packet::request(request_id, request.method_name(), request.params().clone());

    let state = Arc::new(InvocationState {
        done: AtomicBool::new(false),
        conn: conn.clone(),
        request_id,
        request: Mutex::new(Some(request)),
        callback: Mutex::new(Some(callback)),
        timeout: Mutex::new(None),
    });

    let weak: Weak<InvocationState> = Arc::downgrade(&state);
    let task = conn.scheduler().create_task(move || {
        if let Some(state) = weak.upgrade() {
            state.on_timeout();
        }
    });
    task.schedule(timeout);
    *state.timeout.lock() = Some(task);

    let reply_state = state.clone();
    let handler = Box::new(move |event: ReplyEvent| reply_state.on_reply(event));
    if !conn.post_packet(packet, Some(handler)) {
        state.complete(|req| req.set_error_code(ErrorCode::CONNECTION));
    }
    PendingRequest { state }
}

/// Send `request` without waiting for, or getting, an answer.
pub(crate) fn invoke_void(conn: &ConnectionShared, mut request: Request) -> bool {
    request.set_noreply(true);
    let request_id = conn.allocate_request_id();
    let packet = Packet::request(request_id, request.method_name(), request.params().clone())
        .with_flags(FLAG_NOREPLY);
    conn.post_packet(packet, None)
}
