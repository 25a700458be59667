// Core modules implementing the durable log, range arbitration, and error modeling.
pub mod batch;
pub mod entry;
pub mod error;
pub mod ids;
pub mod log;
pub mod pool;
pub mod queue;
mod recovery;
pub mod ring;
pub mod store;
pub mod worker;
