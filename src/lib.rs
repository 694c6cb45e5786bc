//! # reactor-rpc
//!
//! Binary, multiplexed RPC over persistent TCP connections.
//!
//! Peers invoke named, typed methods on each other over a single socket in
//! both directions. Requests are matched to replies by id, so any number can
//! be in flight at once.
//!
//! ## Layers
//! - [`core`]: byte buffers, typed values and the 12-byte-header packet framing
//! - [`crypto`]: pluggable connection crypto (plaintext, XOR test cipher, TLS,
//!   TLS-or-plaintext auto-detection)
//! - [`transport`]: reactor threads, connections, acceptors, connector, worker
//! - [`protocol`]: requests, methods, targets and the [`Supervisor`]
//! - [`utils`]: queues, the timer wheel, logging and metrics
//!
//! ## Threads
//! Each connection belongs to exactly one reactor thread, which alone touches
//! its socket and buffers. Other threads reach it only through the reactor's
//! command queue and the connection's locked outbound queue.
//!
//! ## Example
//! ```rust,no_run
//! use std::time::Duration;
//! use reactor_rpc::{Method, NetworkConfig, Request, Spec, Supervisor};
//!
//! # fn main() -> reactor_rpc::Result<()> {
//! let server = Supervisor::new(&NetworkConfig::default())?;
//! server.add_method(
//!     Method::new("math.add", "ii", "i", |req: &mut Request| {
//!         let a = req.params().get(0).and_then(|v| v.as_i32()).unwrap_or(0);
//!         let b = req.params().get(1).and_then(|v| v.as_i32()).unwrap_or(0);
//!         req.returns_mut().add(a.wrapping_add(b));
//!     })
//!     .describe("Add two numbers"),
//! );
//! let acceptor = server.listen(&Spec::parse("tcp/0"))?;
//!
//! let client = Supervisor::new(&NetworkConfig::default())?;
//! let target = client.get_target(&Spec::from_port(acceptor.local_port()))?;
//! let mut req = Request::new("math.add");
//! req.params_mut().add(2i32).add(3i32);
//! let req = target.invoke_sync(req, Duration::from_secs(5));
//! assert_eq!(req.returns().get(0).and_then(|v| v.as_i32()), Some(5));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use core::packet::Packet;
pub use core::value::{Value, Values};
pub use error::{ProtocolError, Result};
pub use protocol::{ErrorCode, Method, PendingRequest, Request, Supervisor, Target};
pub use transport::spec::Spec;
pub use transport::{Acceptor, Transport, TransportBuilder};
