//! Redis-backed implementation of StreamTransport
//!
//! Thin delegation layer: every operation maps to one Redis Streams command
//! on a shared [`ConnectionManager`]. Protocol errors are folded into the
//! [`TransportError`] categories; no retries happen here.

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, RedisError};
use tracing::debug;

use crate::id::StreamId;
use crate::transport::{
    AddId, Fields, GroupInfo, GroupStart, ReadOptions, ReadTarget, StreamBatch, StreamMessage,
    StreamTransport, TransportError,
};

/// [`StreamTransport`] speaking to a Redis server.
///
/// The connection is established by [`StreamTransport::connect`]; operations
/// before that fail with [`TransportError::Unavailable`].
pub struct RedisTransport {
    url: String,
    manager: Mutex<Option<ConnectionManager>>,
}

impl RedisTransport {
    /// Create a transport for the given `redis://` URL. Credentials ride in
    /// the URL userinfo section.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            manager: Mutex::new(None),
        }
    }

    fn connection(&self) -> Result<ConnectionManager, TransportError> {
        self.manager
            .lock()
            .clone()
            .ok_or_else(|| TransportError::Unavailable("not connected".to_string()))
    }

    fn map_err(stream: &str, group: Option<&str>, err: RedisError) -> TransportError {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            return TransportError::Unavailable(err.to_string());
        }
        match err.code() {
            Some("BUSYGROUP") => TransportError::GroupExists {
                stream: stream.to_string(),
                group: group.unwrap_or_default().to_string(),
            },
            Some("NOGROUP") => TransportError::NoGroup {
                stream: stream.to_string(),
                group: group.unwrap_or_default().to_string(),
            },
            _ if err.to_string().contains("no such key") => {
                TransportError::NoSuchKey(stream.to_string())
            }
            _ => TransportError::Protocol(err.to_string()),
        }
    }

    fn parse_id(raw: &str) -> Result<StreamId, TransportError> {
        raw.parse()
            .map_err(|_| TransportError::Protocol(format!("unparseable stream id {raw:?}")))
    }

    fn decode_reply(reply: StreamReadReply) -> Result<Vec<StreamBatch>, TransportError> {
        let mut batches = Vec::with_capacity(reply.keys.len());
        for key in reply.keys {
            let mut messages = Vec::with_capacity(key.ids.len());
            for entry in key.ids {
                let id = Self::parse_id(&entry.id)?;
                let mut fields = Fields::with_capacity(entry.map.len());
                for (name, value) in entry.map {
                    let value: String = redis::from_redis_value(&value).map_err(|e| {
                        TransportError::Protocol(format!("non-string field {name:?}: {e}"))
                    })?;
                    fields.insert(name, value);
                }
                messages.push(StreamMessage { id, fields });
            }
            if !messages.is_empty() {
                batches.push(StreamBatch {
                    stream: key.key,
                    messages,
                });
            }
        }
        Ok(batches)
    }
}

#[async_trait]
impl StreamTransport for RedisTransport {
    async fn add(
        &self,
        stream: &str,
        id: AddId,
        fields: Fields,
    ) -> Result<StreamId, TransportError> {
        let mut con = self.connection()?;
        let id_arg = match id {
            AddId::Auto => "*".to_string(),
            AddId::At(explicit) => explicit.to_string(),
        };
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        let assigned: String = con
            .xadd_map(stream, id_arg.as_str(), &pairs)
            .await
            .map_err(|e| Self::map_err(stream, None, e))?;
        Self::parse_id(&assigned)
    }

    async fn create_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        mkstream: bool,
    ) -> Result<(), TransportError> {
        let mut con = self.connection()?;
        let start_arg = match start {
            GroupStart::Oldest => "0".to_string(),
            GroupStart::Tip => "$".to_string(),
            GroupStart::At(id) => id.to_string(),
        };
        let result: Result<String, RedisError> = if mkstream {
            con.xgroup_create_mkstream(stream, group, start_arg.as_str())
                .await
        } else {
            con.xgroup_create(stream, group, start_arg.as_str()).await
        };
        result
            .map(|_| ())
            .map_err(|e| Self::map_err(stream, Some(group), e))
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        targets: &[(String, ReadTarget)],
        opts: ReadOptions,
    ) -> Result<Option<Vec<StreamBatch>>, TransportError> {
        let mut con = self.connection()?;

        let keys: Vec<&str> = targets.iter().map(|(s, _)| s.as_str()).collect();
        let ids: Vec<String> = targets
            .iter()
            .map(|(_, target)| match target {
                ReadTarget::New => ">".to_string(),
                ReadTarget::Pending => "0".to_string(),
                ReadTarget::From(id) => id.to_string(),
            })
            .collect();
        let ids: Vec<&str> = ids.iter().map(String::as_str).collect();

        let mut options = StreamReadOptions::default().group(group, consumer);
        if let Some(count) = opts.count {
            options = options.count(count);
        }
        if let Some(block) = opts.block {
            options = options.block(block.as_millis() as usize);
        }

        let reply: StreamReadReply = con
            .xread_options(&keys, &ids, &options)
            .await
            .map_err(|e| Self::map_err(keys.first().copied().unwrap_or(""), Some(group), e))?;

        let batches = Self::decode_reply(reply)?;
        Ok(if batches.is_empty() { None } else { Some(batches) })
    }

    async fn ack(&self, stream: &str, group: &str, id: StreamId) -> Result<u64, TransportError> {
        let mut con = self.connection()?;
        con.xack(stream, group, &[id.to_string()])
            .await
            .map_err(|e| Self::map_err(stream, Some(group), e))
    }

    async fn len(&self, stream: &str) -> Result<u64, TransportError> {
        let mut con = self.connection()?;
        con.xlen(stream)
            .await
            .map_err(|e| Self::map_err(stream, None, e))
    }

    async fn delete(&self, stream: &str) -> Result<bool, TransportError> {
        let mut con = self.connection()?;
        let removed: u64 = con
            .del(stream)
            .await
            .map_err(|e| Self::map_err(stream, None, e))?;
        Ok(removed > 0)
    }

    async fn group_info(&self, stream: &str) -> Result<Vec<GroupInfo>, TransportError> {
        let mut con = self.connection()?;
        let reply: redis::streams::StreamInfoGroupsReply = con
            .xinfo_groups(stream)
            .await
            .map_err(|e| Self::map_err(stream, None, e))?;

        reply
            .groups
            .into_iter()
            .map(|g| {
                Ok(GroupInfo {
                    name: g.name,
                    consumers: g.consumers as u64,
                    pending: g.pending as u64,
                    last_delivered_id: Self::parse_id(&g.last_delivered_id)?,
                })
            })
            .collect()
    }

    async fn destroy_group(&self, stream: &str, group: &str) -> Result<bool, TransportError> {
        let mut con = self.connection()?;
        let removed: u64 = con
            .xgroup_destroy(stream, group)
            .await
            .map_err(|e| Self::map_err(stream, Some(group), e))?;
        Ok(removed > 0)
    }

    async fn connect(&self) -> Result<(), TransportError> {
        let client = redis::Client::open(self.url.as_str())
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;
        *self.manager.lock() = Some(manager);
        debug!("redis transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        *self.manager.lock() = None;
        Ok(())
    }
}
