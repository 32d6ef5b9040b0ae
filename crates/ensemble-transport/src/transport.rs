//! StreamTransport trait definition
//!
//! The contract both backends implement. Semantics follow Redis Streams:
//! totally ordered entry IDs per stream, consumer groups with a last-delivered
//! cursor, and per-consumer pending-entry sets until acknowledgment.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::id::StreamId;

/// Field map carried by one stream entry. Values are short strings; larger
/// payloads ride JSON-encoded inside a single field.
pub type Fields = HashMap<String, String>;

/// One entry read from a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamMessage {
    pub id: StreamId,
    pub fields: Fields,
}

/// Messages returned for one stream in a read call
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub stream: String,
    pub messages: Vec<StreamMessage>,
}

/// ID selector for [`StreamTransport::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddId {
    /// Allocate the next ID, strictly greater than every existing entry (`*`)
    Auto,
    /// Append at an explicit ID; must be greater than the stream's last ID
    At(StreamId),
}

/// Starting cursor for [`StreamTransport::create_group`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupStart {
    /// Deliver from the oldest entry (`0`)
    Oldest,
    /// Deliver only entries added after group creation (`$`)
    Tip,
    /// Deliver entries strictly after the given ID
    At(StreamId),
}

/// Read cursor for [`StreamTransport::read_group`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadTarget {
    /// New messages beyond the group's last-delivered cursor (`>`)
    New,
    /// This consumer's pending (delivered, unacked) entries (`0`)
    Pending,
    /// Entries strictly greater than the given ID; no group state change
    From(StreamId),
}

/// Options for [`StreamTransport::read_group`]
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Maximum messages per stream (None = backend default)
    pub count: Option<usize>,
    /// Block up to this long waiting for new messages before returning empty
    pub block: Option<Duration>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    pub fn with_block(mut self, block: Duration) -> Self {
        self.block = Some(block);
        self
    }
}

/// Per-group summary returned by [`StreamTransport::group_info`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    /// Number of consumers the group has seen
    pub consumers: u64,
    /// Total pending entries across all consumers
    pub pending: u64,
    pub last_delivered_id: StreamId,
}

/// Transport failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection-level failure (network, broker down)
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Stream does not exist where one is required
    #[error("no such stream: {0}")]
    NoSuchKey(String),

    /// Group creation raced an existing group
    #[error("consumer group {group} already exists on stream {stream}")]
    GroupExists { stream: String, group: String },

    /// Read against a group that was never created
    #[error("no such consumer group {group} on stream {stream}")]
    NoGroup { stream: String, group: String },

    /// Explicit add ID not greater than the stream's last ID
    #[error("id {id} is not greater than the last id {last} of stream {stream}")]
    IdNotMonotonic {
        stream: String,
        id: StreamId,
        last: StreamId,
    },

    /// Any other protocol-level failure
    #[error("transport protocol error: {0}")]
    Protocol(String),
}

/// Stream + consumer-group primitive.
///
/// Implementations must be safe to share across workers (`Arc<dyn
/// StreamTransport>`); all group state mutation happens behind the
/// implementation's own synchronization. The transport performs no implicit
/// retries - retry policy belongs to the callers.
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Append an entry, returning the assigned ID.
    ///
    /// With [`AddId::Auto`] the ID is allocated atomically and strictly
    /// greater than every existing ID in the stream.
    async fn add(&self, stream: &str, id: AddId, fields: Fields)
        -> Result<StreamId, TransportError>;

    /// Create a consumer group at the given start cursor.
    ///
    /// With `mkstream`, an empty stream is created if absent; without it a
    /// missing stream fails [`TransportError::NoSuchKey`]. Re-creating an
    /// existing group fails [`TransportError::GroupExists`].
    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), TransportError>;

    /// Read on behalf of `consumer` in `group` from each `(stream, target)`.
    ///
    /// For [`ReadTarget::New`], delivered messages advance the group cursor
    /// and join the consumer's pending set. [`ReadTarget::Pending`] returns
    /// the consumer's own pending entries without mutation.
    /// [`ReadTarget::From`] reads past an explicit ID without touching group
    /// state. Returns `None` when nothing matched (after blocking up to
    /// `opts.block`, if set).
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        targets: &[(String, ReadTarget)],
        opts: ReadOptions,
    ) -> Result<Option<Vec<StreamBatch>>, TransportError>;

    /// Acknowledge one entry, removing it from whichever consumer's pending
    /// set holds it. Returns the number acknowledged (0 or 1).
    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<u64, TransportError>;

    /// Number of entries in the stream (0 if absent)
    async fn len(&self, stream: &str) -> Result<u64, TransportError>;

    /// Delete a stream and all its group state. Returns whether it existed.
    async fn delete(&self, stream: &str) -> Result<bool, TransportError>;

    /// Summaries for every group on the stream
    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>, TransportError>;

    /// Destroy one group. Returns whether it existed.
    async fn destroy_group(&self, stream: &str, group: &str) -> Result<bool, TransportError>;

    /// Establish the backend connection (no-op where connections are lazy)
    async fn connect(&self) -> Result<(), TransportError>;

    /// Release listeners and drop cached state
    async fn disconnect(&self) -> Result<(), TransportError>;
}
