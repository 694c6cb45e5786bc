//! # Utility Modules
//!
//! Supporting utilities used by the reactor and the RPC layer.
//!
//! ## Components
//! - **Queue**: single-owner ring and the locked cross-thread handoff queue
//! - **Scheduler**: hashed timer wheel for request timeouts
//! - **Logging**: structured logging configuration
//! - **Metrics**: per-transport observability counters

pub mod logging;
pub mod metrics;
pub mod queue;
pub mod scheduler;

pub use metrics::{MetricsSnapshot, TransportMetrics};
pub use queue::{Queue, ThreadQueue};
pub use scheduler::{Scheduler, Task};
