//! Background thread for work that must not stall a reactor.
//!
//! Two kinds of jobs: CPU-heavy handshake steps, and closing sockets the
//! reactors have let go of. When the queue is full or the worker has stopped,
//! [`Worker::post`] runs the job on the caller's thread instead, so a job is
//! never lost and a flooded worker slows its producers down.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Sender, TrySendError};
use mio::net::TcpStream;
use mio::Token;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::crypto::CryptoSocket;
use crate::error::Result;
use crate::transport::thread::{panic_message, Command, ReactorHandle};
use crate::transport::FatalErrorHandler;

pub(crate) enum Job {
    /// Run `do_handshake_work`, then give the crypto state back to its reactor.
    HandshakeWork {
        crypto: Box<dyn CryptoSocket>,
        reactor: Arc<ReactorHandle>,
        token: Token,
    },
    /// Close a socket off the reactor thread.
    CloseSocket(TcpStream),
}

pub(crate) struct Worker {
    sender: Mutex<Option<Sender<Job>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub(crate) fn start(queue_size: usize, fatal: FatalErrorHandler) -> Result<Arc<Worker>> {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(queue_size.max(1));
        let join = thread::Builder::new()
            .name("reactor-rpc-worker".into())
            .spawn(move || {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                    for job in rx.iter() {
                        run_job(job);
                    }
                }));
                if let Err(panic) = outcome {
                    fatal(&format!(
                        "reactor-rpc-worker panicked: {}",
                        panic_message(panic.as_ref())
                    ));
                }
                debug!("Worker stopped");
            })?;
        Ok(Arc::new(Worker {
            sender: Mutex::new(Some(tx)),
            join: Mutex::new(Some(join)),
        }))
    }

    /// Queue `job`, or run it right here if the queue cannot take it.
    pub(crate) fn post(&self, job: Job) {
        let job = match self.sender.lock().as_ref() {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => job,
            },
            None => job,
        };
        trace!("Running job inline");
        run_job(job);
    }

    /// Finish queued jobs and stop. Jobs posted afterwards run inline.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
        if let Some(join) = self.join.lock().take() {
            let _ = join.join();
        }
    }
}

fn run_job(job: Job) {
    match job {
        Job::HandshakeWork {
            mut crypto,
            reactor,
            token,
        } => {
            crypto.do_handshake_work();
            if reactor.post(Command::HandshakeDone(token, crypto)).is_err() {
                trace!(reactor = reactor.name(), "Reactor gone, dropping handshake state");
            }
        }
        Job::CloseSocket(stream) => {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            drop(stream);
        }
    }
}
