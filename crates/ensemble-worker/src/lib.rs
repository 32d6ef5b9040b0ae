//! # Persona workers
//!
//! - [`dedup`] - process-wide duplicate tracker keyed by
//!   `(task_id, corr_id, persona)` with a TTL sweeper
//! - [`pool`] - the persona consumer pool: every persona gets one
//!   cooperative worker, all sharing a single consumer group on the request
//!   stream, with routing by `to_persona` and ack-and-skip for everything
//!   addressed elsewhere

pub mod dedup;
pub mod pool;

pub use dedup::{DuplicateTracker, TrackerStats};
pub use pool::{PersonaPool, PoolConfig, PoolError};
