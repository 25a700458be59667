//! Purpose: Durable multi-producer/single-consumer log over byte-addressable storage.
//! Exports: `api` (stable surface), `core` (log, tracker, stores, errors).
//! Role: Library backing the `mpsclog` CLI and tests.
//! Invariants: Producers never block on each other; a full log is reported, not waited on.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
