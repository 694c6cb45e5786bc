//! Plaintext passthrough.

use std::io;

use super::{
    read_socket, renegotiation_error, write_socket, CryptoEngine, CryptoSocket, FlushResult,
    HandshakeResult, Replay, Stream,
};
use crate::error::Result;
use crate::transport::spec::Spec;

#[derive(Debug, Default)]
pub struct NullCryptoSocket {
    replay: Replay,
    done: bool,
}

impl NullCryptoSocket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Socket that first hands back `bytes`, already read off the stream.
    pub(crate) fn with_replay(bytes: Vec<u8>) -> Self {
        Self {
            replay: Replay::new(bytes),
            done: false,
        }
    }
}

impl CryptoSocket for NullCryptoSocket {
    fn handshake(&mut self, _io: &mut dyn Stream) -> io::Result<HandshakeResult> {
        if self.done {
            return Err(renegotiation_error());
        }
        self.done = true;
        Ok(HandshakeResult::Done)
    }

    fn do_handshake_work(&mut self) {}

    fn read(&mut self, io: &mut dyn Stream, dst: &mut [u8]) -> io::Result<usize> {
        match self.replay.read(dst) {
            0 => read_socket(io, dst),
            n => Ok(n),
        }
    }

    fn drain(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        Ok(self.replay.read(dst))
    }

    fn write(&mut self, io: &mut dyn Stream, src: &[u8]) -> io::Result<usize> {
        write_socket(io, src)
    }

    fn flush(&mut self, _io: &mut dyn Stream) -> io::Result<FlushResult> {
        Ok(FlushResult::Done)
    }
}

/// Engine producing [`NullCryptoSocket`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCryptoEngine;

impl CryptoEngine for NullCryptoEngine {
    fn create_client_crypto(&self, _spec: &Spec) -> Result<Box<dyn CryptoSocket>> {
        Ok(Box::new(NullCryptoSocket::new()))
    }

    fn create_server_crypto(&self) -> Result<Box<dyn CryptoSocket>> {
        Ok(Box::new(NullCryptoSocket::new()))
    }

    fn name(&self) -> &'static str {
        "null"
    }
}
