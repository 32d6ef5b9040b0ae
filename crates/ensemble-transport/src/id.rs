//! Stream entry identifiers
//!
//! Wire form is `{milliseconds}-{sequence}`. Ordering is the numeric pair
//! order, never the string order: `100-2` sorts before `90-1` as a string but
//! after it as an ID.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of one entry within a stream.
///
/// IDs are strictly increasing per stream. Auto-allocated IDs combine the
/// wall clock in milliseconds with a sequence number that breaks ties within
/// the same millisecond.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamId {
    /// Wall-clock milliseconds component
    pub ms: u64,
    /// Tie-breaking sequence within the millisecond
    pub seq: u64,
}

impl StreamId {
    /// The zero ID, smaller than every allocated ID (`0-0`)
    pub const ZERO: StreamId = StreamId { ms: 0, seq: 0 };

    /// Create an ID from its components
    pub fn new(ms: u64, seq: u64) -> Self {
        Self { ms, seq }
    }

    /// The next ID in total order (`seq + 1`, rolling into `ms + 1`)
    pub fn successor(self) -> Self {
        match self.seq.checked_add(1) {
            Some(seq) => Self { ms: self.ms, seq },
            None => Self {
                ms: self.ms + 1,
                seq: 0,
            },
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.ms, self.seq)
    }
}

/// Error parsing a stream ID from its wire form
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream id: {0:?}")]
pub struct ParseStreamIdError(pub String);

impl FromStr for StreamId {
    type Err = ParseStreamIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // A bare millisecond value is accepted as `{ms}-0`, matching the
        // server-side parse of explicit read positions.
        let (ms, seq) = match s.split_once('-') {
            Some((ms, seq)) => (ms, seq),
            None => (s, "0"),
        };
        let ms = ms
            .parse::<u64>()
            .map_err(|_| ParseStreamIdError(s.to_string()))?;
        let seq = seq
            .parse::<u64>()
            .map_err(|_| ParseStreamIdError(s.to_string()))?;
        Ok(StreamId { ms, seq })
    }
}

impl TryFrom<String> for StreamId {
    type Error = ParseStreamIdError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<StreamId> for String {
    fn from(id: StreamId) -> String {
        id.to_string()
    }
}
