//! Single-byte XOR obfuscation.
//!
//! Not encryption. It exists so tests can run every crypto code path (a
//! handshake with a read, a write and a work step; transformed payload) without
//! certificates. Each side sends a random key byte and XORs what it writes
//! with its own key; the receiver undoes it with the peer's key.

use std::io;

use rand::Rng;

use super::{
    read_socket, renegotiation_error, write_socket, CryptoEngine, CryptoSocket, FlushResult,
    HandshakeResult, Stream,
};
use crate::error::Result;
use crate::transport::spec::Spec;

#[derive(Debug)]
pub struct XorCryptoSocket {
    own_key: u8,
    key_sent: bool,
    peer_key: Option<u8>,
    work_done: bool,
    done: bool,
    scratch: Vec<u8>,
}

impl XorCryptoSocket {
    pub fn new() -> Self {
        Self::with_key(rand::rng().random_range(1..=u8::MAX))
    }

    pub fn with_key(own_key: u8) -> Self {
        Self {
            own_key,
            key_sent: false,
            peer_key: None,
            work_done: false,
            done: false,
            scratch: Vec::new(),
        }
    }
}

impl Default for XorCryptoSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoSocket for XorCryptoSocket {
    fn handshake(&mut self, io: &mut dyn Stream) -> io::Result<HandshakeResult> {
        if self.done {
            return Err(renegotiation_error());
        }
        if !self.key_sent {
            if write_socket(io, &[self.own_key])? == 0 {
                return Ok(HandshakeResult::NeedWrite);
            }
            self.key_sent = true;
        }
        if self.peer_key.is_none() {
            let mut key = [0u8; 1];
            if read_socket(io, &mut key)? == 0 {
                return Ok(HandshakeResult::NeedRead);
            }
            self.peer_key = Some(key[0]);
        }
        if !self.work_done {
            return Ok(HandshakeResult::NeedWork);
        }
        self.done = true;
        Ok(HandshakeResult::Done)
    }

    fn do_handshake_work(&mut self) {
        self.work_done = true;
    }

    fn read(&mut self, io: &mut dyn Stream, dst: &mut [u8]) -> io::Result<usize> {
        let n = read_socket(io, dst)?;
        let key = self.peer_key.unwrap_or(0);
        dst[..n].iter_mut().for_each(|b| *b ^= key);
        Ok(n)
    }

    fn drain(&mut self, _dst: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn write(&mut self, io: &mut dyn Stream, src: &[u8]) -> io::Result<usize> {
        self.scratch.clear();
        self.scratch.extend(src.iter().map(|b| b ^ self.own_key));
        write_socket(io, &self.scratch)
    }

    fn flush(&mut self, _io: &mut dyn Stream) -> io::Result<FlushResult> {
        Ok(FlushResult::Done)
    }

    fn drop_empty_buffers(&mut self) {
        self.scratch = Vec::new();
    }
}

/// Engine producing [`XorCryptoSocket`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct XorCryptoEngine;

impl CryptoEngine for XorCryptoEngine {
    fn create_client_crypto(&self, _spec: &Spec) -> Result<Box<dyn CryptoSocket>> {
        Ok(Box::new(XorCryptoSocket::new()))
    }

    fn create_server_crypto(&self) -> Result<Box<dyn CryptoSocket>> {
        Ok(Box::new(XorCryptoSocket::new()))
    }

    fn name(&self) -> &'static str {
        "xor"
    }
}
