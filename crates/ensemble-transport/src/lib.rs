//! # Message Transport
//!
//! Stream + consumer-group messaging primitive used by every Ensemble worker.
//!
//! The [`StreamTransport`] trait models a small slice of the Redis Streams
//! command set: append-only streams of field maps with totally ordered IDs,
//! and named consumer groups where each message is delivered to exactly one
//! consumer until acknowledged.
//!
//! Two implementations ship with this crate:
//!
//! - [`RedisTransport`] delegates every operation to a Redis server and is the
//!   production backend for multi-process deployments.
//! - [`MemoryTransport`] keeps the same state machine in process memory and
//!   wakes blocked readers through a notifier. It backs tests and single-box
//!   runs, with semantics identical to the Redis backend.
//!
//! Delivery is at-least-once: a crashed consumer leaves its pending entries
//! behind, and redelivery protection lives upstream (see the duplicate
//! tracker in `ensemble-worker`).

pub mod id;
pub mod memory;
pub mod redis;
pub mod transport;

pub use id::StreamId;
pub use memory::MemoryTransport;
pub use self::redis::RedisTransport;
pub use transport::{
    AddId, Fields, GroupInfo, GroupStart, ReadOptions, ReadTarget, StreamBatch, StreamMessage,
    StreamTransport, TransportError,
};
