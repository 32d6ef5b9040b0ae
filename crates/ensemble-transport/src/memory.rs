//! In-process implementation of StreamTransport
//!
//! Keeps the full stream + group state machine in memory behind a single
//! mutex, with a notifier to wake blocked readers when entries arrive. It is
//! the backend for tests and single-box runs and mirrors the Redis backend's
//! semantics entry for entry.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::id::StreamId;
use crate::transport::{
    AddId, Fields, GroupInfo, GroupStart, ReadOptions, ReadTarget, StreamBatch, StreamMessage,
    StreamTransport, TransportError,
};

/// One stream's entries plus the high-water ID used for allocation.
///
/// `last_id` survives independently of `entries` so allocation stays
/// monotonic even if trimming is added later.
#[derive(Default)]
struct StreamState {
    entries: Vec<StreamMessage>,
    last_id: StreamId,
}

/// Consumer-group cursor plus per-consumer pending sets
#[derive(Default)]
struct GroupState {
    last_delivered: StreamId,
    /// consumer name -> delivered-but-unacked entry IDs
    consumers: HashMap<String, BTreeSet<StreamId>>,
}

#[derive(Default)]
struct Shared {
    streams: HashMap<String, StreamState>,
    /// stream name -> group name -> state
    groups: HashMap<String, HashMap<String, GroupState>>,
}

struct Inner {
    state: Mutex<Shared>,
    /// Wakes readers blocked in `read_group` when any stream gains an entry
    added: Notify,
}

/// In-process [`StreamTransport`].
///
/// Cloning is cheap and clones share state, so a pool of workers and the
/// engine can hold the same bus.
///
/// # Example
///
/// ```
/// use ensemble_transport::MemoryTransport;
///
/// let bus = MemoryTransport::new();
/// ```
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl MemoryTransport {
    /// Create an empty in-process bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(Shared::default()),
                added: Notify::new(),
            }),
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Allocate the next auto ID for a stream: wall clock milliseconds with a
    /// sequence tie-break, never less than or equal to the stream's last ID
    /// even if the clock steps backwards.
    fn next_id(last: StreamId) -> StreamId {
        let now = Self::now_ms();
        if now > last.ms {
            StreamId::new(now, 0)
        } else {
            last.successor()
        }
    }

    /// One non-blocking read pass over all targets. Returns batches that
    /// contain at least one message.
    fn read_pass(
        shared: &mut Shared,
        group: &str,
        consumer: &str,
        targets: &[(String, ReadTarget)],
        count: usize,
    ) -> Result<Vec<StreamBatch>, TransportError> {
        let mut batches = Vec::new();

        for (stream, target) in targets {
            let group_state = shared
                .groups
                .get_mut(stream.as_str())
                .and_then(|g| g.get_mut(group))
                .ok_or_else(|| TransportError::NoGroup {
                    stream: stream.clone(),
                    group: group.to_string(),
                })?;
            let entries = shared
                .streams
                .get(stream.as_str())
                .map(|s| s.entries.as_slice())
                .unwrap_or(&[]);

            let messages: Vec<StreamMessage> = match target {
                ReadTarget::New => {
                    let cursor = group_state.last_delivered;
                    let delivered: Vec<StreamMessage> = entries
                        .iter()
                        .filter(|m| m.id > cursor)
                        .take(count)
                        .cloned()
                        .collect();
                    let pending = group_state.consumers.entry(consumer.to_string()).or_default();
                    for m in &delivered {
                        pending.insert(m.id);
                        group_state.last_delivered = group_state.last_delivered.max(m.id);
                    }
                    delivered
                }
                ReadTarget::Pending => {
                    let pending = group_state.consumers.entry(consumer.to_string()).or_default();
                    entries
                        .iter()
                        .filter(|m| pending.contains(&m.id))
                        .take(count)
                        .cloned()
                        .collect()
                }
                ReadTarget::From(id) => entries
                    .iter()
                    .filter(|m| m.id > *id)
                    .take(count)
                    .cloned()
                    .collect(),
            };

            if !messages.is_empty() {
                batches.push(StreamBatch {
                    stream: stream.clone(),
                    messages,
                });
            }
        }

        Ok(batches)
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamTransport for MemoryTransport {
    async fn add(
        &self,
        stream: &str,
        id: AddId,
        fields: Fields,
    ) -> Result<StreamId, TransportError> {
        let assigned = {
            let mut shared = self.inner.state.lock();
            let state = shared.streams.entry(stream.to_string()).or_default();

            let assigned = match id {
                AddId::Auto => Self::next_id(state.last_id),
                AddId::At(explicit) => {
                    if explicit <= state.last_id {
                        return Err(TransportError::IdNotMonotonic {
                            stream: stream.to_string(),
                            id: explicit,
                            last: state.last_id,
                        });
                    }
                    explicit
                }
            };

            state.entries.push(StreamMessage {
                id: assigned,
                fields,
            });
            state.last_id = assigned;
            assigned
        };

        trace!(stream, id = %assigned, "appended entry");
        self.inner.added.notify_waiters();
        Ok(assigned)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), TransportError> {
        let mut shared = self.inner.state.lock();

        if !shared.streams.contains_key(stream) {
            if mkstream {
                shared.streams.insert(stream.to_string(), StreamState::default());
            } else {
                return Err(TransportError::NoSuchKey(stream.to_string()));
            }
        }

        let last_id = shared.streams[stream].last_id;
        let groups = shared.groups.entry(stream.to_string()).or_default();
        if groups.contains_key(group) {
            return Err(TransportError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }

        let last_delivered = match start {
            GroupStart::Oldest => StreamId::ZERO,
            GroupStart::Tip => last_id,
            GroupStart::At(id) => id,
        };

        groups.insert(
            group.to_string(),
            GroupState {
                last_delivered,
                consumers: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        targets: &[(String, ReadTarget)],
        opts: ReadOptions,
    ) -> Result<Option<Vec<StreamBatch>>, TransportError> {
        let count = opts.count.unwrap_or(usize::MAX);

        // Arm the notifier before the first pass so an add racing the read is
        // not missed while blocking.
        let notified = self.inner.added.notified();
        tokio::pin!(notified);

        let batches = {
            let mut shared = self.inner.state.lock();
            Self::read_pass(&mut shared, group, consumer, targets, count)?
        };
        if !batches.is_empty() {
            return Ok(Some(batches));
        }

        let Some(block) = opts.block.filter(|b| !b.is_zero()) else {
            return Ok(None);
        };

        // Wait for any new entry, then re-read once.
        if tokio::time::timeout(block, &mut notified).await.is_err() {
            return Ok(None);
        }

        let batches = {
            let mut shared = self.inner.state.lock();
            Self::read_pass(&mut shared, group, consumer, targets, count)?
        };
        Ok(if batches.is_empty() { None } else { Some(batches) })
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<u64, TransportError> {
        let mut shared = self.inner.state.lock();
        let Some(group_state) = shared
            .groups
            .get_mut(stream)
            .and_then(|g| g.get_mut(group))
        else {
            return Ok(0);
        };

        for pending in group_state.consumers.values_mut() {
            if pending.remove(&id) {
                return Ok(1);
            }
        }
        Ok(0)
    }

    async fn len(&self, stream: &str) -> Result<u64, TransportError> {
        let shared = self.inner.state.lock();
        Ok(shared
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }

    async fn delete(&self, stream: &str) -> Result<bool, TransportError> {
        let mut shared = self.inner.state.lock();
        let existed = shared.streams.remove(stream).is_some();
        shared.groups.remove(stream);
        Ok(existed)
    }

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>, TransportError> {
        let shared = self.inner.state.lock();
        if !shared.streams.contains_key(stream) {
            return Err(TransportError::NoSuchKey(stream.to_string()));
        }

        let mut infos: Vec<GroupInfo> = shared
            .groups
            .get(stream)
            .map(|groups| {
                groups
                    .iter()
                    .map(|(name, state)| GroupInfo {
                        name: name.clone(),
                        consumers: state.consumers.len() as u64,
                        pending: state.consumers.values().map(|p| p.len() as u64).sum(),
                        last_delivered_id: state.last_delivered,
                    })
                    .collect()
            })
            .unwrap_or_default();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<bool, TransportError> {
        let mut shared = self.inner.state.lock();
        if !shared.streams.contains_key(stream) {
            return Err(TransportError::NoSuchKey(stream.to_string()));
        }
        Ok(shared
            .groups
            .get_mut(stream)
            .map(|g| g.remove(group).is_some())
            .unwrap_or(false))
    }

    async fn connect(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        // Drop cached state and release any blocked readers.
        {
            let mut shared = self.inner.state.lock();
            shared.streams.clear();
            shared.groups.clear();
        }
        self.inner.added.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn fields(pairs: &[(&str, &str)]) -> Fields {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_auto_ids_strictly_increase() {
        let bus = MemoryTransport::new();
        let mut last = StreamId::ZERO;
        for i in 0..100 {
            let id = bus
                .add("s", AddId::Auto, fields(&[("n", &i.to_string())]))
                .await
                .unwrap();
            assert!(id > last, "id {id} not greater than {last}");
            last = id;
        }
    }

    #[tokio::test]
    async fn test_explicit_id_must_be_monotonic() {
        let bus = MemoryTransport::new();
        bus.add("s", AddId::At(StreamId::new(10, 0)), fields(&[]))
            .await
            .unwrap();
        let err = bus
            .add("s", AddId::At(StreamId::new(10, 0)), fields(&[]))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::IdNotMonotonic { .. }));
    }

    #[tokio::test]
    async fn test_group_create_semantics() {
        let bus = MemoryTransport::new();

        // Missing stream without MKSTREAM
        let err = bus
            .create_group("missing", "g", GroupStart::Oldest, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoSuchKey(_)));

        // MKSTREAM creates an empty stream
        bus.create_group("s", "g", GroupStart::Oldest, true)
            .await
            .unwrap();
        assert_eq!(bus.len("s").await.unwrap(), 0);

        // Re-creating fails with a stable error
        let err = bus
            .create_group("s", "g", GroupStart::Oldest, false)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::GroupExists { .. }));
    }

    #[tokio::test]
    async fn test_read_new_advances_cursor_and_tracks_pending() {
        let bus = MemoryTransport::new();
        bus.create_group("s", "g", GroupStart::Oldest, true)
            .await
            .unwrap();
        let a = bus.add("s", AddId::Auto, fields(&[("k", "1")])).await.unwrap();
        let b = bus.add("s", AddId::Auto, fields(&[("k", "2")])).await.unwrap();

        let batches = bus
            .read_group(
                "g",
                "c1",
                &[("s".to_string(), ReadTarget::New)],
                ReadOptions::new(),
            )
            .await
            .unwrap()
            .unwrap();
        let ids: Vec<StreamId> = batches[0].messages.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![a, b]);

        let info = bus.group_info("s").await.unwrap();
        assert_eq!(info[0].last_delivered_id, b);
        assert_eq!(info[0].pending, 2);

        // A second reader sees nothing new
        let again = bus
            .read_group(
                "g",
                "c2",
                &[("s".to_string(), ReadTarget::New)],
                ReadOptions::new(),
            )
            .await
            .unwrap();
        assert!(again.is_none());
    }

    #[tokio::test]
    async fn test_pending_read_is_per_consumer_and_nondestructive() {
        let bus = MemoryTransport::new();
        bus.create_group("s", "g", GroupStart::Oldest, true)
            .await
            .unwrap();
        let id = bus.add("s", AddId::Auto, fields(&[("k", "v")])).await.unwrap();

        bus.read_group(
            "g",
            "c1",
            &[("s".to_string(), ReadTarget::New)],
            ReadOptions::new(),
        )
        .await
        .unwrap();

        // c1's pending read returns the entry twice in a row
        for _ in 0..2 {
            let pending = bus
                .read_group(
                    "g",
                    "c1",
                    &[("s".to_string(), ReadTarget::Pending)],
                    ReadOptions::new(),
                )
                .await
                .unwrap()
                .unwrap();
            assert_eq!(pending[0].messages[0].id, id);
        }

        // c2 has no pending entries
        let empty = bus
            .read_group(
                "g",
                "c2",
                &[("s".to_string(), ReadTarget::Pending)],
                ReadOptions::new(),
            )
            .await
            .unwrap();
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_ack_removes_from_exactly_one_pending_set() {
        let bus = MemoryTransport::new();
        bus.create_group("s", "g", GroupStart::Oldest, true)
            .await
            .unwrap();
        let id = bus.add("s", AddId::Auto, fields(&[("k", "v")])).await.unwrap();

        bus.read_group(
            "g",
            "c1",
            &[("s".to_string(), ReadTarget::New)],
            ReadOptions::new(),
        )
        .await
        .unwrap();

        assert_eq!(bus.ack("s", "g", id).await.unwrap(), 1);
        assert_eq!(bus.ack("s", "g", id).await.unwrap(), 0);

        let info = bus.group_info("s").await.unwrap();
        assert_eq!(info[0].pending, 0);
    }

    #[tokio::test]
    async fn test_unknown_group_errors() {
        let bus = MemoryTransport::new();
        bus.add("s", AddId::Auto, fields(&[])).await.unwrap();
        let err = bus
            .read_group(
                "nope",
                "c",
                &[("s".to_string(), ReadTarget::New)],
                ReadOptions::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NoGroup { .. }));
    }

    #[tokio::test]
    async fn test_blocked_read_wakes_on_add() {
        let bus = MemoryTransport::new();
        bus.create_group("s", "g", GroupStart::Oldest, true)
            .await
            .unwrap();

        let reader = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.read_group(
                    "g",
                    "c",
                    &[("s".to_string(), ReadTarget::New)],
                    ReadOptions::new().with_block(Duration::from_secs(5)),
                )
                .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.add("s", AddId::Auto, fields(&[("k", "v")])).await.unwrap();

        let batches = reader.await.unwrap().unwrap().unwrap();
        assert_eq!(batches[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_blocked_read_times_out() {
        let bus = MemoryTransport::new();
        bus.create_group("s", "g", GroupStart::Oldest, true)
            .await
            .unwrap();

        let read = bus
            .read_group(
                "g",
                "c",
                &[("s".to_string(), ReadTarget::New)],
                ReadOptions::new().with_block(Duration::from_millis(30)),
            )
            .await
            .unwrap();
        assert!(read.is_none());
    }

    #[tokio::test]
    async fn test_tip_group_skips_existing_entries() {
        let bus = MemoryTransport::new();
        bus.add("s", AddId::Auto, fields(&[("old", "1")])).await.unwrap();
        bus.create_group("s", "g", GroupStart::Tip, false)
            .await
            .unwrap();

        let read = bus
            .read_group(
                "g",
                "c",
                &[("s".to_string(), ReadTarget::New)],
                ReadOptions::new(),
            )
            .await
            .unwrap();
        assert!(read.is_none());

        bus.add("s", AddId::Auto, fields(&[("new", "2")])).await.unwrap();
        let read = bus
            .read_group(
                "g",
                "c",
                &[("s".to_string(), ReadTarget::New)],
                ReadOptions::new(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read[0].messages.len(), 1);
    }

    #[tokio::test]
    async fn test_disconnect_drops_state() {
        let bus = MemoryTransport::new();
        bus.add("s", AddId::Auto, fields(&[("k", "v")])).await.unwrap();
        bus.disconnect().await.unwrap();
        assert_eq!(bus.len("s").await.unwrap(), 0);
    }
}
