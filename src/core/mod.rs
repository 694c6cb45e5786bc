//! # Core Wire Components
//!
//! Byte buffers, the typed value system and packet framing.
//!
//! ## Components
//! - **Buffer**: growable read/write byte buffer owned by one connection
//! - **Value / Values**: tagged RPC values and their wire codec
//! - **Packet / PacketInfo**: 12-byte header framing for Request, Reply and Error
//! - **Codec**: tokio codec over the same framing
//!
//! ## Wire Format
//! ```text
//! [Length(4)] [Flags(2)] [PacketCode(2)] [RequestId(4)] [Body(N)]
//! ```
//!
//! ## Security
//! - Maximum packet size is enforced before any body bytes are buffered
//! - Array counts are checked against the bytes actually present before allocation

pub mod buffer;
pub mod codec;
pub mod packet;
pub mod value;
