//! # Nexus Storage
//!
//! The two stateful, concurrency-controlled subsystems the read scheduler leans on: the
//! interval-aware on-disk cache engine (spec §4.F) and the process-global memory tracker
//! (spec §4.G). Grounded in `rde-io`'s sink file-I/O lifecycle (buffered writer setup, path
//! derivation from an id) generalized to a fixed-layout binary cache file, and in the
//! teacher's `tokio::sync`-first concurrency toolkit for the tracker's waiter queue.

pub mod cache;
pub mod memory;

pub use cache::{CacheEngine, IntervalIndex};
pub use memory::{MemoryTracker, TrackerGrant};
