//! # RPC Layer
//!
//! Requests, methods and the supervisor tying them to a transport.
//!
//! ## Components
//! - **Request / ErrorCode**: one call with its parameters, results and error
//! - **Method / MethodRegistry**: named, typed handlers behind a copy-on-write table
//! - **Target / PendingRequest**: client side; sync, async and fire-and-forget calls
//! - **Supervisor**: server side dispatch plus built-in reflection methods
//!
//! ## Completion
//! Every client request completes exactly once, with a reply, an error
//! packet, a timeout, a connection failure or an abort, whichever comes first.

pub mod invocation;
pub mod method;
pub mod registry;
pub mod request;
pub mod supervisor;
pub mod target;

pub use invocation::{PendingRequest, RequestCallback};
pub use method::{Method, MethodHandler};
pub use registry::MethodRegistry;
pub use request::{DetachedRequest, ErrorCode, Request};
pub use supervisor::Supervisor;
pub use target::{Target, TargetWatcher};
