//! # Packet Framing
//!
//! Every packet starts with a fixed 12-byte header, always big-endian:
//!
//! ```text
//! [length: u32] [flags: u16] [packet code: u16] [request id: u32] [body]
//! ```
//!
//! `length` counts every byte after itself (total packet length minus 4).
//! The body layout depends on the packet code:
//!
//! ```text
//! Request (100): [method name: string] [parameters: Values]
//! Reply   (101): [return values: Values]
//! Error   (102): [error code: u32] [message: string]
//! ```
//!
//! With [`FLAG_REVERSE`] set, body integers are little-endian; the header is not
//! affected. [`FLAG_NOREPLY`] marks a request whose caller expects no answer.

use bytes::BufMut;

use crate::core::value::{put_u32, ByteOrder, Values, WireReader};
use crate::error::{constants, DecodeError, ProtocolError, Result};

/// Size of the fixed packet header.
pub const HEADER_LENGTH: usize = 12;

/// Body integers are little-endian.
pub const FLAG_REVERSE: u16 = 0x0001;

/// The sender does not want a reply.
pub const FLAG_NOREPLY: u16 = 0x0002;

pub const PCODE_REQUEST: u16 = 100;
pub const PCODE_REPLY: u16 = 101;
pub const PCODE_ERROR: u16 = 102;

/// Packet payload, one variant per packet code.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketBody {
    Request { method: String, params: Values },
    Reply { values: Values },
    Error { code: u32, message: String },
}

impl PacketBody {
    pub fn packet_code(&self) -> u16 {
        match self {
            PacketBody::Request { .. } => PCODE_REQUEST,
            PacketBody::Reply { .. } => PCODE_REPLY,
            PacketBody::Error { .. } => PCODE_ERROR,
        }
    }

    /// Encoded body size in bytes.
    pub fn bytes(&self) -> usize {
        match self {
            PacketBody::Request { method, params } => 4 + method.len() + params.bytes(),
            PacketBody::Reply { values } => values.bytes(),
            PacketBody::Error { message, .. } => 4 + 4 + message.len(),
        }
    }

    fn encode(&self, dst: &mut impl BufMut, order: ByteOrder) {
        match self {
            PacketBody::Request { method, params } => {
                put_u32(dst, method.len() as u32, order);
                dst.put_slice(method.as_bytes());
                params.encode(dst, order);
            }
            PacketBody::Reply { values } => values.encode(dst, order),
            PacketBody::Error { code, message } => {
                put_u32(dst, *code, order);
                put_u32(dst, message.len() as u32, order);
                dst.put_slice(message.as_bytes());
            }
        }
    }

    fn decode(packet_code: u16, src: &mut WireReader<'_>) -> Result<PacketBody> {
        let body = match packet_code {
            PCODE_REQUEST => {
                let len = src.u32()? as usize;
                let method = std::str::from_utf8(src.take(len)?)
                    .map_err(|_| DecodeError::InvalidUtf8)?
                    .to_string();
                let params = Values::decode(src)?;
                PacketBody::Request { method, params }
            }
            PCODE_REPLY => PacketBody::Reply {
                values: Values::decode(src)?,
            },
            PCODE_ERROR => {
                let code = src.u32()?;
                let len = src.u32()? as usize;
                let message = String::from_utf8_lossy(src.take(len)?).into_owned();
                PacketBody::Error { code, message }
            }
            other => {
                return Err(ProtocolError::InvalidPacket(format!(
                    "{}: {other}",
                    constants::ERR_UNKNOWN_PACKET_CODE
                )))
            }
        };
        Ok(body)
    }
}

/// A framed packet: header fields plus body.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub flags: u16,
    pub request_id: u32,
    pub body: PacketBody,
}

impl Packet {
    pub fn new(flags: u16, request_id: u32, body: PacketBody) -> Self {
        Self {
            flags,
            request_id,
            body,
        }
    }

    pub fn request(request_id: u32, method: impl Into<String>, params: Values) -> Self {
        Self::new(
            0,
            request_id,
            PacketBody::Request {
                method: method.into(),
                params,
            },
        )
    }

    pub fn reply(request_id: u32, values: Values) -> Self {
        Self::new(0, request_id, PacketBody::Reply { values })
    }

    pub fn error(request_id: u32, code: u32, message: impl Into<String>) -> Self {
        Self::new(
            0,
            request_id,
            PacketBody::Error {
                code,
                message: message.into(),
            },
        )
    }

    /// Set or clear header flags, builder style.
    pub fn with_flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn packet_code(&self) -> u16 {
        self.body.packet_code()
    }

    pub fn byte_order(&self) -> ByteOrder {
        byte_order(self.flags)
    }

    pub fn is_noreply(&self) -> bool {
        self.flags & FLAG_NOREPLY != 0
    }

    /// Total encoded length, header included.
    pub fn packet_length(&self) -> usize {
        HEADER_LENGTH + self.body.bytes()
    }

    /// Write header and body; exactly [`Packet::packet_length`] bytes.
    pub fn encode(&self, dst: &mut impl BufMut) {
        let before = dst.remaining_mut();
        let length = self.packet_length();
        dst.put_u32((length - 4) as u32);
        dst.put_u16(self.flags);
        dst.put_u16(self.packet_code());
        dst.put_u32(self.request_id);
        self.body.encode(dst, self.byte_order());
        debug_assert_eq!(
            before - dst.remaining_mut(),
            length,
            "encoded size differs from declared packet length"
        );
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.packet_length());
        self.encode(&mut buf);
        buf
    }
}

fn byte_order(flags: u16) -> ByteOrder {
    if flags & FLAG_REVERSE != 0 {
        ByteOrder::Little
    } else {
        ByteOrder::Big
    }
}

/// Header fields peeked from a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    packet_length: usize,
    flags: u16,
    packet_code: u16,
    request_id: u32,
}

impl PacketInfo {
    /// Inspect the header without consuming anything.
    ///
    /// Returns `None` while fewer than [`HEADER_LENGTH`] bytes are buffered.
    pub fn peek(buf: &[u8]) -> Option<PacketInfo> {
        let header: &[u8; HEADER_LENGTH] = buf.get(..HEADER_LENGTH)?.try_into().ok()?;
        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        Some(PacketInfo {
            packet_length: length as usize + 4,
            flags: u16::from_be_bytes([header[4], header[5]]),
            packet_code: u16::from_be_bytes([header[6], header[7]]),
            request_id: u32::from_be_bytes([header[8], header[9], header[10], header[11]]),
        })
    }

    /// Total declared packet length, header included.
    pub fn packet_length(&self) -> usize {
        self.packet_length
    }

    pub fn flags(&self) -> u16 {
        self.flags
    }

    pub fn packet_code(&self) -> u16 {
        self.packet_code
    }

    pub fn request_id(&self) -> u32 {
        self.request_id
    }

    pub fn byte_order(&self) -> ByteOrder {
        byte_order(self.flags)
    }

    /// Whether `available` buffered bytes hold the whole packet.
    pub fn is_complete(&self, available: usize) -> bool {
        available >= self.packet_length
    }

    /// Reject headers no well-behaved peer would send.
    pub fn validate(&self, max_packet_size: usize) -> Result<()> {
        if self.packet_length < HEADER_LENGTH {
            return Err(ProtocolError::InvalidPacket(format!(
                "{}: declared length {}",
                constants::ERR_INVALID_HEADER,
                self.packet_length
            )));
        }
        if self.packet_length > max_packet_size {
            return Err(ProtocolError::OversizedPacket(self.packet_length));
        }
        match self.packet_code {
            PCODE_REQUEST | PCODE_REPLY | PCODE_ERROR => Ok(()),
            other => Err(ProtocolError::InvalidPacket(format!(
                "{}: {other}",
                constants::ERR_UNKNOWN_PACKET_CODE
            ))),
        }
    }

    /// Decode the packet from `buf`, which starts at the header.
    ///
    /// Consumes exactly [`PacketInfo::packet_length`] bytes. Any failure means
    /// the frame was well-formed but its content is garbage.
    pub fn decode_packet(&self, buf: &[u8]) -> Result<Packet> {
        let frame = buf.get(HEADER_LENGTH..self.packet_length).ok_or_else(|| {
            ProtocolError::InvalidPacket(format!(
                "{}: have {} of {} bytes",
                constants::ERR_INVALID_HEADER,
                buf.len(),
                self.packet_length
            ))
        })?;
        let mut src = WireReader::new(frame, self.byte_order());
        let body = PacketBody::decode(self.packet_code, &mut src)?;
        if src.remaining() != 0 {
            return Err(ProtocolError::InvalidPacket(format!(
                "{}: {} bytes left over",
                constants::ERR_TRAILING_BYTES,
                src.remaining()
            )));
        }
        Ok(Packet::new(self.flags, self.request_id, body))
    }
}

/// Try to take one whole packet off the front of `buf`.
///
/// `Ok(None)` means more bytes are needed; errors are connection-fatal.
pub fn decode_frame(buf: &[u8], max_packet_size: usize) -> Result<Option<(PacketInfo, Packet)>> {
    let Some(info) = PacketInfo::peek(buf) else {
        return Ok(None);
    };
    info.validate(max_packet_size)?;
    if !info.is_complete(buf.len()) {
        return Ok(None);
    }
    let packet = info.decode_packet(buf)?;
    Ok(Some((info, packet)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Value;

    const MAX: usize = 16 * 1024 * 1024;

    fn echo_request() -> Packet {
        let mut params = Values::new();
        params.add(42i32);
        Packet::request(7, "echo", params)
    }

    #[test]
    fn test_request_header_layout() {
        let bytes = echo_request().to_bytes();
        // 4 + "echo" + count + tag + i32
        let body = 4 + 4 + 4 + 1 + 4;
        assert_eq!(bytes.len(), HEADER_LENGTH + body);
        assert_eq!(&bytes[0..4], &((HEADER_LENGTH + body - 4) as u32).to_be_bytes());
        assert_eq!(&bytes[4..6], &[0, 0]);
        assert_eq!(&bytes[6..8], &PCODE_REQUEST.to_be_bytes());
        assert_eq!(&bytes[8..12], &7u32.to_be_bytes());
    }

    #[test]
    fn test_peek_needs_full_header() {
        let bytes = echo_request().to_bytes();
        for cut in 0..HEADER_LENGTH {
            assert!(PacketInfo::peek(&bytes[..cut]).is_none());
        }
        let info = PacketInfo::peek(&bytes[..HEADER_LENGTH]).expect("header");
        assert_eq!(info.packet_length(), bytes.len());
        assert_eq!(info.request_id(), 7);
        assert!(!info.is_complete(HEADER_LENGTH));
    }

    #[test]
    fn test_decode_frame_waits_for_body() {
        let bytes = echo_request().to_bytes();
        for cut in 0..bytes.len() {
            assert!(decode_frame(&bytes[..cut], MAX).expect("partial").is_none());
        }
        let (info, packet) = decode_frame(&bytes, MAX).expect("ok").expect("whole");
        assert_eq!(info.packet_length(), bytes.len());
        assert_eq!(packet, echo_request());
    }

    #[test]
    fn test_reverse_flag_only_affects_body() {
        let packet = echo_request().with_flags(FLAG_REVERSE);
        let bytes = packet.to_bytes();
        assert_eq!(&bytes[8..12], &7u32.to_be_bytes());
        // method name length is the first body field
        assert_eq!(&bytes[12..16], &4u32.to_le_bytes());
        let info = PacketInfo::peek(&bytes).expect("header");
        assert_eq!(info.decode_packet(&bytes).expect("decode"), packet);
    }

    #[test]
    fn test_garbled_body_is_error() {
        let mut bytes = echo_request().to_bytes();
        // corrupt the value tag
        let tag_pos = HEADER_LENGTH + 4 + 4 + 4;
        bytes[tag_pos] = b'?';
        let info = PacketInfo::peek(&bytes).expect("header");
        assert!(matches!(
            info.decode_packet(&bytes),
            Err(ProtocolError::Decode(DecodeError::UnknownType(b'?')))
        ));
    }

    #[test]
    fn test_declared_length_too_long_for_body() {
        let mut bytes = Packet::reply(1, Values::new()).to_bytes();
        bytes.extend_from_slice(&[0, 0]);
        let length = (bytes.len() - 4) as u32;
        bytes[0..4].copy_from_slice(&length.to_be_bytes());
        let err = decode_frame(&bytes, MAX).unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPacket(_)));
    }

    #[test]
    fn test_bad_headers_rejected() {
        let mut short = vec![0u8; HEADER_LENGTH];
        short[3] = 4;
        assert!(decode_frame(&short, MAX).is_err());

        let mut huge = Packet::reply(1, Values::new()).to_bytes();
        huge[0..4].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            decode_frame(&huge, MAX),
            Err(ProtocolError::OversizedPacket(_))
        ));

        let mut unknown = Packet::reply(1, Values::new()).to_bytes();
        unknown[6..8].copy_from_slice(&999u16.to_be_bytes());
        assert!(decode_frame(&unknown, MAX).is_err());
    }

    #[test]
    fn test_error_packet_roundtrip() {
        let packet = Packet::error(9, 106, "No such method").with_flags(FLAG_NOREPLY);
        let bytes = packet.to_bytes();
        let (_, decoded) = decode_frame(&bytes, MAX).expect("ok").expect("whole");
        assert_eq!(decoded, packet);
        assert!(decoded.is_noreply());
    }

    #[test]
    fn test_encode_into_exact_slice() {
        let mut values = Values::new();
        values.add(Value::DoubleArray(vec![1.0, 2.0]));
        let packet = Packet::reply(3, values);
        let mut out = vec![0u8; packet.packet_length()];
        let mut slot = &mut out[..];
        packet.encode(&mut slot);
        assert!(slot.is_empty());
        assert_eq!(out, packet.to_bytes());
    }
}
