//! # Connections
//!
//! A connection is split in two halves:
//!
//! - [`Connection`] owns the socket, the crypto state and both I/O buffers. It
//!   lives inside exactly one reactor and is only touched from that thread.
//! - [`ConnectionShared`] is what every other thread sees: lifecycle state, the
//!   outbound packet queue, handlers waiting for replies and close watchers,
//!   all behind a single lock.
//!
//! Other threads never touch the socket. They enqueue packets on the shared half
//! and, when the queue goes from empty to non-empty, post one `EnableWrite`
//! command to the owning reactor.
//!
//! ## Lifecycle
//! ```text
//! Initial -> Connecting -> Connected -> Closed
//!      \__________\_____________________/^
//! ```
//! State only moves forward. Once `Closed`, every pending reply handler has been
//! told the connection is down and every watcher has been notified, exactly once.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::config::TransportConfig;
use crate::core::buffer::Buffer;
use crate::core::packet::{decode_frame, Packet, PacketBody};
use crate::crypto::{AuthContext, CryptoSocket, FlushResult, HandshakeResult};
use crate::error::{ProtocolError, Result};
use crate::transport::spec::Spec;
use crate::transport::thread::{Command, ReactorHandle};
use crate::transport::worker::{Job, Worker};
use crate::transport::RequestDispatcher;
use crate::utils::metrics::TransportMetrics;
use crate::utils::queue::Queue;
use crate::utils::scheduler::Scheduler;

/// Lifecycle of a connection; never moves backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ConnectionState {
    Initial = 0,
    Connecting = 1,
    Connected = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ConnectionState::Initial,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Closed,
        }
    }
}

/// What a reply handler is woken up with.
#[derive(Debug)]
pub enum ReplyEvent {
    /// A Reply or Error packet carrying the handler's request id.
    Packet(Packet),
    /// The connection closed before an answer arrived.
    ConnectionDown,
}

/// Called once, on the reactor thread, with the outcome of a request.
pub type ReplyHandler = Box<dyn FnOnce(ReplyEvent) + Send>;

/// Told when a connection goes down.
pub trait ConnectionWatcher: Send + Sync {
    fn connection_closed(&self, conn: &Arc<ConnectionShared>);
}

/// Per-connection limits, taken from [`TransportConfig`].
#[derive(Debug, Clone)]
pub(crate) struct ConnectionSettings {
    pub max_input_buffer_size: usize,
    pub max_output_buffer_size: usize,
    pub drop_empty_buffers: bool,
    pub io_budget: usize,
    pub max_packet_size: usize,
    pub tcp_no_delay: bool,
}

impl From<&TransportConfig> for ConnectionSettings {
    fn from(config: &TransportConfig) -> Self {
        Self {
            max_input_buffer_size: config.max_input_buffer_size,
            max_output_buffer_size: config.max_output_buffer_size,
            drop_empty_buffers: config.drop_empty_buffers,
            io_budget: config.write_budget.max(1),
            max_packet_size: config.max_packet_size,
            tcp_no_delay: config.tcp_no_delay,
        }
    }
}

struct SharedInner {
    outbound: Queue<Packet>,
    write_posted: bool,
    pending: HashMap<u32, ReplyHandler>,
    watchers: Vec<Arc<dyn ConnectionWatcher>>,
    auth: AuthContext,
}

/// Thread-safe half of a connection.
pub struct ConnectionShared {
    token: Token,
    spec: Spec,
    is_server: bool,
    state: AtomicU8,
    close_requested: AtomicBool,
    next_request: AtomicU32,
    owner: Arc<ReactorHandle>,
    metrics: Arc<TransportMetrics>,
    inner: Mutex<SharedInner>,
}

impl ConnectionShared {
    pub(crate) fn new(
        owner: Arc<ReactorHandle>,
        spec: Spec,
        is_server: bool,
        metrics: Arc<TransportMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            token: owner.next_token(),
            spec,
            is_server,
            state: AtomicU8::new(ConnectionState::Initial as u8),
            close_requested: AtomicBool::new(false),
            next_request: AtomicU32::new(0),
            owner,
            metrics,
            inner: Mutex::new(SharedInner {
                outbound: Queue::new(),
                write_posted: false,
                pending: HashMap::new(),
                watchers: Vec::new(),
                auth: AuthContext::unauthenticated(),
            }),
        })
    }

    /// Remote address for client connections, the peer's address for accepted ones.
    pub fn spec(&self) -> &Spec {
        &self.spec
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether the connection has not closed yet.
    pub fn is_valid(&self) -> bool {
        self.state() != ConnectionState::Closed
    }

    /// Peer identity; unauthenticated until the handshake completes.
    pub fn auth_context(&self) -> AuthContext {
        self.inner.lock().auth.clone()
    }

    /// Timer wheel of the owning reactor.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.owner.scheduler()
    }

    /// Next request id for a request sent on this connection.
    ///
    /// The low bit is 1 for ids allocated on the accepting side and 0 on the
    /// connecting side, so both ends of one socket never collide.
    pub fn allocate_request_id(&self) -> u32 {
        let counter = self.next_request.fetch_add(1, Ordering::Relaxed);
        (counter << 1) | u32::from(self.is_server)
    }

    /// Queue a packet for sending, optionally registering `reply` under its
    /// request id. Returns `false` (dropping both) once the connection is closed.
    pub fn post_packet(&self, packet: Packet, reply: Option<ReplyHandler>) -> bool {
        let wake = {
            let mut inner = self.inner.lock();
            if self.state() == ConnectionState::Closed {
                return false;
            }
            if let Some(handler) = reply {
                inner.pending.insert(packet.request_id, handler);
            }
            inner.outbound.enqueue(packet);
            !std::mem::replace(&mut inner.write_posted, true)
        };
        if wake {
            // a rejected command means the reactor is gone; it closes us on its way out
            let _ = self.owner.post(Command::EnableWrite(self.token));
        }
        true
    }

    /// Remove and return the handler waiting on `request_id`.
    pub fn take_reply(&self, request_id: u32) -> Option<ReplyHandler> {
        self.inner.lock().pending.remove(&request_id)
    }

    /// Number of requests still waiting for an answer.
    pub fn pending_replies(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Ask the owning reactor to close the connection. Never blocks.
    pub fn close(self: &Arc<Self>) {
        self.close_requested.store(true, Ordering::Release);
        if self.owner.post(Command::Close(self.token)).is_err() {
            self.mark_closed();
        }
    }

    /// Register `watcher`; `false` if the connection is already closed.
    pub fn add_watcher(&self, watcher: Arc<dyn ConnectionWatcher>) -> bool {
        let mut inner = self.inner.lock();
        if self.state() == ConnectionState::Closed {
            return false;
        }
        inner.watchers.push(watcher);
        true
    }

    /// Remove a previously added watcher; `false` if it was not registered.
    pub fn remove_watcher(&self, watcher: &Arc<dyn ConnectionWatcher>) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.watchers.len();
        inner.watchers.retain(|w| !Arc::ptr_eq(w, watcher));
        inner.watchers.len() != before
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn owner(&self) -> &Arc<ReactorHandle> {
        &self.owner
    }

    pub(crate) fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    pub(crate) fn close_requested(&self) -> bool {
        self.close_requested.load(Ordering::Acquire)
    }

    /// Move forward to `to`; returns `false` if the state is already there or past it.
    pub(crate) fn advance(&self, to: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                (cur < to as u8).then_some(to as u8)
            })
            .is_ok()
    }

    fn set_auth(&self, auth: AuthContext) {
        self.inner.lock().auth = auth;
    }

    /// Move every queued packet into `dst` and re-arm the write wakeup.
    fn take_outbound(&self, dst: &mut Queue<Packet>) {
        let mut inner = self.inner.lock();
        inner.outbound.flush_into(dst);
        inner.write_posted = false;
    }

    /// Close for good: fail pending handlers, notify watchers. Idempotent.
    pub(crate) fn mark_closed(self: &Arc<Self>) -> bool {
        let (pending, watchers) = {
            let mut inner = self.inner.lock();
            if !self.advance(ConnectionState::Closed) {
                return false;
            }
            inner.outbound.drain().for_each(drop);
            (
                std::mem::take(&mut inner.pending),
                std::mem::take(&mut inner.watchers),
            )
        };
        debug!(
            spec = %self.spec,
            server = self.is_server,
            pending = pending.len(),
            "Connection closed"
        );
        for (_, handler) in pending {
            handler(ReplyEvent::ConnectionDown);
        }
        for watcher in watchers {
            watcher.connection_closed(self);
        }
        true
    }

    fn deliver(self: &Arc<Self>, packet: Packet, dispatcher: &Arc<dyn RequestDispatcher>) {
        if let PacketBody::Request { .. } = packet.body {
            dispatcher.dispatch(self, packet);
            return;
        }
        match self.take_reply(packet.request_id) {
            Some(handler) => handler(ReplyEvent::Packet(packet)),
            None => trace!(
                request_id = packet.request_id,
                "Dropping answer nobody is waiting for"
            ),
        }
    }
}

impl fmt::Debug for ConnectionShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionShared")
            .field("spec", &self.spec)
            .field("is_server", &self.is_server)
            .field("state", &self.state())
            .finish()
    }
}

/// Whether a connection wants another pass without waiting for readiness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Idle,
    Backlog,
}

impl Progress {
    fn or(self, other: Progress) -> Progress {
        if self == Progress::Backlog || other == Progress::Backlog {
            Progress::Backlog
        } else {
            Progress::Idle
        }
    }
}

/// Everything a connection borrows from its reactor for one operation.
///
/// Only the reactor builds one, so holding it is proof of running on the
/// owning thread.
pub(crate) struct IoContext<'a> {
    pub registry: &'a Registry,
    pub settings: &'a ConnectionSettings,
    pub worker: &'a Worker,
    pub dispatcher: &'a Arc<dyn RequestDispatcher>,
    pub metrics: &'a TransportMetrics,
}

/// Reactor-owned half of a connection.
pub(crate) struct Connection {
    shared: Arc<ConnectionShared>,
    stream: TcpStream,
    crypto: Option<Box<dyn CryptoSocket>>,
    handshake_done: bool,
    input: Buffer,
    output: Buffer,
    staged: Queue<Packet>,
    write_blocked: bool,
    interest: Option<Interest>,
}

impl Connection {
    pub(crate) fn new(
        shared: Arc<ConnectionShared>,
        stream: TcpStream,
        crypto: Box<dyn CryptoSocket>,
    ) -> Self {
        Self {
            shared,
            stream,
            crypto: Some(crypto),
            handshake_done: false,
            input: Buffer::default(),
            output: Buffer::default(),
            staged: Queue::new(),
            write_blocked: false,
            interest: None,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<ConnectionShared> {
        &self.shared
    }

    /// First call after the reactor adopts the connection.
    pub(crate) fn start(&mut self, cx: &IoContext<'_>) -> Result<Progress> {
        self.shared.advance(ConnectionState::Connecting);
        cx.metrics.handshake_attempt();
        self.handshake(cx)
    }

    pub(crate) fn on_ready(
        &mut self,
        cx: &IoContext<'_>,
        readable: bool,
        writable: bool,
    ) -> Result<Progress> {
        if self.crypto.is_none() {
            // handshake work is out on the worker
            return Ok(Progress::Idle);
        }
        if !self.handshake_done {
            return self.handshake(cx);
        }
        self.pump(cx, readable, writable)
    }

    pub(crate) fn on_enable_write(&mut self, cx: &IoContext<'_>) -> Result<Progress> {
        if self.crypto.is_none() || !self.handshake_done {
            return Ok(Progress::Idle);
        }
        self.pump(cx, false, true)
    }

    pub(crate) fn on_work_done(
        &mut self,
        cx: &IoContext<'_>,
        crypto: Box<dyn CryptoSocket>,
    ) -> Result<Progress> {
        self.crypto = Some(crypto);
        self.handshake(cx)
    }

    /// Tear down: deregister, fail everything pending, hand the socket off to
    /// be closed.
    pub(crate) fn close(mut self, cx: &IoContext<'_>, reason: Option<&ProtocolError>) {
        if self.interest.is_some() {
            let _ = cx.registry.deregister(&mut self.stream);
        }
        match reason {
            Some(err) => {
                cx.metrics.connection_error();
                debug!(spec = %self.shared.spec(), error = %err, "Closing connection after error");
            }
            None => trace!(spec = %self.shared.spec(), "Closing connection"),
        }
        if self.handshake_done {
            cx.metrics.connection_closed();
        } else {
            cx.metrics.handshake_failed();
        }
        self.shared.mark_closed();
        cx.worker.post(Job::CloseSocket(self.stream));
    }

    fn handshake(&mut self, cx: &IoContext<'_>) -> Result<Progress> {
        let Some(crypto) = self.crypto.as_mut() else {
            return Ok(Progress::Idle);
        };
        match crypto.handshake(&mut self.stream)? {
            HandshakeResult::Done => {
                self.handshake_done = true;
                self.shared.set_auth(crypto.auth_context());
                self.shared.advance(ConnectionState::Connected);
                cx.metrics.handshake_success();
                cx.metrics.connection_established();
                debug!(
                    spec = %self.shared.spec(),
                    server = self.shared.is_server(),
                    "Connection established"
                );
                self.pump(cx, true, true)
            }
            HandshakeResult::NeedRead => {
                self.set_interest(cx.registry, Interest::READABLE)?;
                Ok(Progress::Idle)
            }
            HandshakeResult::NeedWrite => {
                self.set_interest(cx.registry, Interest::WRITABLE)?;
                Ok(Progress::Idle)
            }
            HandshakeResult::NeedWork => {
                if let Some(crypto) = self.crypto.take() {
                    cx.worker.post(Job::HandshakeWork {
                        crypto,
                        reactor: self.shared.owner().clone(),
                        token: self.shared.token(),
                    });
                }
                Ok(Progress::Idle)
            }
        }
    }

    fn pump(&mut self, cx: &IoContext<'_>, readable: bool, writable: bool) -> Result<Progress> {
        let mut progress = Progress::Idle;
        if readable {
            progress = progress.or(self.read_packets(cx)?);
        }
        if writable || !self.write_blocked {
            progress = progress.or(self.write_packets(cx)?);
        }
        self.finish_pass(cx)?;
        Ok(progress)
    }

    fn read_packets(&mut self, cx: &IoContext<'_>) -> Result<Progress> {
        let Some(crypto) = self.crypto.as_mut() else {
            return Ok(Progress::Idle);
        };
        let mut budget = cx.settings.io_budget;
        loop {
            let dst = self.input.get_writable(crypto.min_read_buffer());
            let mut n = crypto.drain(dst)?;
            if n == 0 {
                n = crypto.read(&mut self.stream, dst)?;
            }
            if n == 0 {
                return Ok(Progress::Idle);
            }
            self.input.commit(n);
            cx.metrics.bytes_read(n);
            dispatch_input(&mut self.input, &self.shared, cx)?;
            if n >= budget {
                return Ok(Progress::Backlog);
            }
            budget -= n;
        }
    }

    fn write_packets(&mut self, cx: &IoContext<'_>) -> Result<Progress> {
        let Some(crypto) = self.crypto.as_mut() else {
            return Ok(Progress::Idle);
        };
        self.shared.take_outbound(&mut self.staged);
        let budget = cx.settings.io_budget;
        let mut written = 0;
        self.write_blocked = false;
        loop {
            while self.output.bytes() < budget {
                let Some(packet) = self.staged.dequeue() else {
                    break;
                };
                encode_into(&mut self.output, &packet);
                cx.metrics.packet_sent();
            }
            if self.output.is_empty() {
                break;
            }
            let n = crypto.write(&mut self.stream, self.output.readable())?;
            if n == 0 {
                self.write_blocked = true;
                break;
            }
            self.output.consume(n);
            cx.metrics.bytes_written(n);
            written += n;
            if written >= budget {
                break;
            }
        }
        if crypto.flush(&mut self.stream)? == FlushResult::NeedWrite {
            self.write_blocked = true;
        }
        let more = !self.output.is_empty() || !self.staged.is_empty();
        Ok(if more && !self.write_blocked {
            Progress::Backlog
        } else {
            Progress::Idle
        })
    }

    fn finish_pass(&mut self, cx: &IoContext<'_>) -> Result<()> {
        let interest = if self.write_blocked {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        self.set_interest(cx.registry, interest)?;
        self.input.shrink(cx.settings.max_input_buffer_size);
        self.output.shrink(cx.settings.max_output_buffer_size);
        if cx.settings.drop_empty_buffers && self.output.is_empty() {
            if let Some(crypto) = self.crypto.as_mut() {
                crypto.drop_empty_buffers();
            }
        }
        Ok(())
    }

    fn set_interest(&mut self, registry: &Registry, interest: Interest) -> Result<()> {
        match self.interest {
            Some(current) if current == interest => return Ok(()),
            Some(_) => registry.reregister(&mut self.stream, self.shared.token(), interest)?,
            None => registry.register(&mut self.stream, self.shared.token(), interest)?,
        }
        self.interest = Some(interest);
        Ok(())
    }
}

fn encode_into(output: &mut Buffer, packet: &Packet) {
    let len = packet.packet_length();
    let mut dst = &mut output.get_writable(len)[..len];
    packet.encode(&mut dst);
    output.commit(len);
}

/// Hand every complete packet in `input` to its handler.
fn dispatch_input(
    input: &mut Buffer,
    shared: &Arc<ConnectionShared>,
    cx: &IoContext<'_>,
) -> Result<()> {
    loop {
        let frame = decode_frame(input.readable(), cx.settings.max_packet_size).inspect_err(|_| {
            cx.metrics.protocol_error();
        })?;
        let Some((info, packet)) = frame else {
            return Ok(());
        };
        input.consume(info.packet_length());
        cx.metrics.packet_received();
        shared.deliver(packet, cx.dispatcher);
    }
}
