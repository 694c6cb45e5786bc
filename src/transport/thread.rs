//! # Reactor Threads
//!
//! Each reactor thread owns a [`mio::Poll`], the connections assigned to it and
//! a timer wheel. Other threads talk to it only through [`Command`]s posted on
//! its [`ReactorHandle`]; posting wakes the poll through a [`mio::Waker`].
//!
//! One pass of the loop:
//! 1. poll, for at most one timer tick (not at all if connections are backlogged)
//! 2. run every queued command
//! 3. service ready connections, reads before writes
//! 4. revisit connections that ran out of budget on the previous pass
//! 5. fire due timers

use std::any::Any;
use std::collections::HashMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::crypto::{CryptoEngine, CryptoSocket};
use crate::error::{ProtocolError, Result};
use crate::transport::connection::{Connection, ConnectionSettings, IoContext, Progress};
use crate::transport::worker::Worker;
use crate::transport::{FatalErrorHandler, RequestDispatcher};
use crate::utils::metrics::TransportMetrics;
use crate::utils::queue::{Queue, ThreadQueue};
use crate::utils::scheduler::Scheduler;

const WAKER_TOKEN: Token = Token(0);
const EVENT_CAPACITY: usize = 1024;

/// Work handed to a reactor from another thread.
pub(crate) enum Command {
    /// Adopt a connected socket and start its handshake.
    Add(Box<Connection>),
    /// Outbound packets were queued on an idle connection.
    EnableWrite(Token),
    Close(Token),
    /// Handshake work finished on the worker; the crypto state comes back.
    HandshakeDone(Token, Box<dyn CryptoSocket>),
    /// Acknowledge once every earlier command has run.
    Sync(Sender<()>),
    Shutdown,
}

/// Cross-thread face of one reactor.
pub(crate) struct ReactorHandle {
    name: String,
    commands: ThreadQueue<Command>,
    waker: Waker,
    next_token: AtomicUsize,
    scheduler: Arc<Scheduler>,
    thread_id: OnceLock<ThreadId>,
}

impl ReactorHandle {
    /// Queue `command` and wake the reactor. Fails once the reactor has stopped.
    pub(crate) fn post(&self, command: Command) -> std::result::Result<(), Command> {
        self.commands.enqueue(command)?;
        if let Err(e) = self.waker.wake() {
            debug!(reactor = %self.name, error = %e, "Failed to wake reactor");
        }
        Ok(())
    }

    pub(crate) fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Whether the caller is this reactor's own thread.
    pub(crate) fn is_current(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    /// Block until every command posted before this call has run.
    ///
    /// Returns immediately on the reactor's own thread and once it has stopped.
    pub(crate) fn sync(&self) {
        if self.is_current() {
            return;
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        if self.post(Command::Sync(tx)).is_ok() {
            // the sender is dropped if the reactor exits first
            let _ = rx.recv();
        }
    }

    pub(crate) fn shutdown(&self) {
        let _ = self.post(Command::Shutdown);
    }
}

/// Calls [`CryptoEngine::close`] when the last reactor holding it exits.
pub(crate) struct CryptoRelease(pub Arc<dyn CryptoEngine>);

impl Drop for CryptoRelease {
    fn drop(&mut self) {
        debug!(engine = self.0.name(), "Closing crypto engine");
        self.0.close();
    }
}

/// Shared pieces every reactor is started with.
#[derive(Clone)]
pub(crate) struct ReactorEnv {
    pub settings: Arc<ConnectionSettings>,
    pub worker: Arc<Worker>,
    pub dispatcher: Arc<dyn RequestDispatcher>,
    pub metrics: Arc<TransportMetrics>,
    pub fatal: FatalErrorHandler,
    pub crypto: Arc<CryptoRelease>,
}

/// A running reactor thread.
pub(crate) struct TransportThread {
    handle: Arc<ReactorHandle>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl TransportThread {
    pub(crate) fn spawn(index: usize, tick: Duration, env: ReactorEnv) -> Result<TransportThread> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let name = format!("reactor-rpc-{index}");
        let handle = Arc::new(ReactorHandle {
            name: name.clone(),
            commands: ThreadQueue::new(),
            waker,
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            scheduler: Scheduler::new(tick),
            thread_id: OnceLock::new(),
        });

        let thread_handle = handle.clone();
        let join = thread::Builder::new().name(name).spawn(move || {
            let _ = thread_handle.thread_id.set(thread::current().id());
            let fatal = env.fatal.clone();
            let mut reactor = Reactor::new(poll, thread_handle, env);
            match panic::catch_unwind(AssertUnwindSafe(|| reactor.run())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => fatal(&format!("{}: poll failed: {e}", reactor.handle.name)),
                Err(panic) => fatal(&format!(
                    "{} panicked: {}",
                    reactor.handle.name,
                    panic_message(panic.as_ref())
                )),
            }
            reactor.stop();
        })?;

        Ok(TransportThread {
            handle,
            join: Mutex::new(Some(join)),
        })
    }

    pub(crate) fn handle(&self) -> &Arc<ReactorHandle> {
        &self.handle
    }

    /// Wait for the thread to exit. A no-op from the reactor's own thread.
    pub(crate) fn join(&self) {
        if self.handle.is_current() {
            return;
        }
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

struct Reactor {
    poll: Poll,
    handle: Arc<ReactorHandle>,
    env: ReactorEnv,
    connections: HashMap<Token, Connection>,
    backlog: Vec<Token>,
    commands: Queue<Command>,
    shutting_down: bool,
}

impl Reactor {
    fn new(poll: Poll, handle: Arc<ReactorHandle>, env: ReactorEnv) -> Self {
        Self {
            poll,
            handle,
            env,
            connections: HashMap::new(),
            backlog: Vec::new(),
            commands: Queue::new(),
            shutting_down: false,
        }
    }

    fn run(&mut self) -> io::Result<()> {
        info!(reactor = %self.handle.name, "Reactor started");
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        let tick = self.handle.scheduler.tick();
        loop {
            let timeout = if self.backlog.is_empty() {
                tick
            } else {
                Duration::ZERO
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            self.run_commands();
            if self.shutting_down {
                return Ok(());
            }

            let revisit = std::mem::take(&mut self.backlog);
            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                let readable = event.is_readable() || event.is_read_closed() || event.is_error();
                let writable = event.is_writable() || event.is_write_closed();
                self.with_connection(token, |conn, cx| conn.on_ready(cx, readable, writable));
            }
            for token in revisit {
                if !self.backlog.contains(&token) {
                    self.with_connection(token, |conn, cx| conn.on_ready(cx, true, true));
                }
            }

            self.handle.scheduler.check_tasks(Instant::now());
        }
    }

    fn run_commands(&mut self) {
        self.handle.commands.flush_into(&mut self.commands);
        while let Some(command) = self.commands.dequeue() {
            self.apply(command);
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Add(conn) => self.add(*conn),
            Command::EnableWrite(token) => {
                self.with_connection(token, |conn, cx| conn.on_enable_write(cx))
            }
            Command::Close(token) => {
                if let Some(conn) = self.connections.remove(&token) {
                    self.close_connection(conn, None);
                }
            }
            Command::HandshakeDone(token, crypto) => {
                self.with_connection(token, move |conn, cx| conn.on_work_done(cx, crypto))
            }
            Command::Sync(ack) => {
                let _ = ack.send(());
            }
            Command::Shutdown => self.shutting_down = true,
        }
    }

    fn add(&mut self, conn: Connection) {
        if self.shutting_down || conn.shared().close_requested() {
            self.close_connection(conn, None);
            return;
        }
        let token = conn.shared().token();
        trace!(reactor = %self.handle.name, spec = %conn.shared().spec(), "Adopting connection");
        self.connections.insert(token, conn);
        self.with_connection(token, |conn, cx| conn.start(cx));
    }

    fn with_connection<F>(&mut self, token: Token, op: F)
    where
        F: FnOnce(&mut Connection, &IoContext<'_>) -> Result<Progress>,
    {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let cx = IoContext {
            registry: self.poll.registry(),
            settings: &self.env.settings,
            worker: &self.env.worker,
            dispatcher: &self.env.dispatcher,
            metrics: &self.env.metrics,
        };
        match op(conn, &cx) {
            Ok(Progress::Idle) => {}
            Ok(Progress::Backlog) => self.backlog.push(token),
            Err(e) => {
                if let Some(conn) = self.connections.remove(&token) {
                    self.close_connection(conn, Some(e));
                }
            }
        }
    }

    fn close_connection(&self, conn: Connection, reason: Option<ProtocolError>) {
        let cx = IoContext {
            registry: self.poll.registry(),
            settings: &self.env.settings,
            worker: &self.env.worker,
            dispatcher: &self.env.dispatcher,
            metrics: &self.env.metrics,
        };
        conn.close(&cx, reason.as_ref());
    }

    /// Refuse further commands and close everything still owned.
    fn stop(&mut self) {
        self.shutting_down = true;
        self.handle.commands.close();
        self.handle.commands.flush_into(&mut self.commands);
        while let Some(command) = self.commands.dequeue() {
            self.apply(command);
        }
        let connections = std::mem::take(&mut self.connections);
        let count = connections.len();
        for (_, conn) in connections {
            self.close_connection(conn, None);
        }
        info!(reactor = %self.handle.name, closed = count, "Reactor stopped");
    }
}

#[cfg(test)]
impl ReactorHandle {
    /// Handle with no thread behind it; posted commands just pile up.
    pub(crate) fn detached(tick: Duration) -> (Poll, Arc<ReactorHandle>) {
        let poll = Poll::new().expect("poll");
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).expect("waker");
        let handle = Arc::new(ReactorHandle {
            name: "reactor-rpc-test".to_string(),
            commands: ThreadQueue::new(),
            waker,
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
            scheduler: Scheduler::new(tick),
            thread_id: OnceLock::new(),
        });
        (poll, handle)
    }

    pub(crate) fn queued_commands(&self) -> usize {
        self.commands.len()
    }

    pub(crate) fn stop_accepting(&self) {
        self.commands.close();
    }
}
