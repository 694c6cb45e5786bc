//! # Async Framing Adapter
//!
//! [`PacketCodec`] speaks the same framing as the reactor connections, as a
//! `tokio_util` codec. It lets tokio-based peers (tools, tests, bridges) talk
//! to a transport without going through the reactor.
//!
//! ```rust,no_run
//! use futures::{SinkExt, StreamExt};
//! use reactor_rpc::core::codec::PacketCodec;
//! use reactor_rpc::core::packet::Packet;
//! use reactor_rpc::core::value::Values;
//! use tokio::net::TcpStream;
//! use tokio_util::codec::Framed;
//!
//! # async fn run() -> reactor_rpc::error::Result<()> {
//! let stream = TcpStream::connect("127.0.0.1:9000").await?;
//! let mut framed = Framed::new(stream, PacketCodec::default());
//! framed.send(Packet::request(0, "frt.rpc.ping", Values::new())).await?;
//! let reply = framed.next().await;
//! # let _ = reply;
//! # Ok(())
//! # }
//! ```

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_PACKET_SIZE;
use crate::core::packet::{decode_frame, Packet};
use crate::error::{ProtocolError, Result};

/// Length-delimited packet codec.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>> {
        match decode_frame(src, self.max_packet_size)? {
            Some((info, packet)) => {
                src.advance(info.packet_length());
                Ok(Some(packet))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = ProtocolError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<()> {
        let length = packet.packet_length();
        if length > self.max_packet_size {
            return Err(ProtocolError::OversizedPacket(length));
        }
        dst.reserve(length);
        packet.encode(dst);
        Ok(())
    }
}
