//! Purpose: Define the stable public Rust API boundary for mpsclog.
//! Exports: Queue, worker, batch, store, and error types needed by the CLI and embedders.
//! Role: Public, additive-only surface; tracker internals stay in `core`.
//! Invariants: Everything an application needs to produce and consume is reachable here.

#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::batch::{Batch, Entries};
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::ids::WorkerIds;
pub use crate::core::log::DurableLog;
pub use crate::core::pool::{Pool, PoolInfo, PoolOptions};
pub use crate::core::queue::Queue;
pub use crate::core::store::{DurableStore, MemStore};
pub use crate::core::worker::Worker;
