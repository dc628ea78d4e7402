//! Redis Streams backend.
//!
//! Maps the [`Broker`] primitives onto `XADD`, `XGROUP CREATE ... MKSTREAM`,
//! `XREADGROUP`, `XACK`, `XPENDING` and `XAUTOCLAIM`.
//!
//! Two [`ConnectionManager`]s are kept: one for blocking group reads and one
//! for every other command. A blocking `XREADGROUP` occupies its connection
//! until it returns, so appends and acks must not queue behind it.

use super::{Broker, EntryId, ReadCursor, StreamRecord};
use crate::error::BrokerError;
use ::redis::aio::ConnectionManager;
use ::redis::streams::{StreamId, StreamPendingReply, StreamRangeReply, StreamReadReply};
use ::redis::{AsyncCommands, Client, Value, from_redis_value};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[derive(Clone)]
struct Connections {
  commands: ConnectionManager,
  reader: ConnectionManager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
  Idle,
  Open,
  Closed,
}

/// [`Broker`] implementation backed by Redis Streams.
pub struct RedisBroker {
  client: Client,
  url: String,
  state: Mutex<(Phase, Option<Connections>)>,
}

impl RedisBroker {
  /// Creates a broker for `connection_url` without connecting.
  ///
  /// # Errors
  ///
  /// Returns [`BrokerError::Redis`] when the URL cannot be parsed.
  pub fn new(connection_url: impl Into<String>) -> Result<Self, BrokerError> {
    let url = connection_url.into();
    let client = Client::open(url.as_str())?;
    Ok(Self {
      client,
      url,
      state: Mutex::new((Phase::Idle, None)),
    })
  }

  /// Connection URL this broker was built with.
  pub fn connection_url(&self) -> &str {
    &self.url
  }

  async fn connections(&self) -> Result<Connections, BrokerError> {
    let state = self.state.lock().await;
    match (&state.0, &state.1) {
      (Phase::Open, Some(connections)) => Ok(connections.clone()),
      (Phase::Closed, _) => Err(BrokerError::Closed),
      _ => Err(BrokerError::NotConnected),
    }
  }
}

impl std::fmt::Debug for RedisBroker {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RedisBroker")
      .field("url", &self.url)
      .finish_non_exhaustive()
  }
}

fn to_record(entry: StreamId) -> StreamRecord {
  let mut fields = HashMap::with_capacity(entry.map.len());
  for (field, value) in &entry.map {
    match from_redis_value::<String>(value) {
      Ok(text) => {
        fields.insert(field.clone(), text);
      }
      Err(e) => {
        warn!(entry_id = %entry.id, field = %field, error = %e, "Skipping non-string stream field");
      }
    }
  }
  StreamRecord {
    id: entry.id,
    fields,
  }
}

#[async_trait]
impl Broker for RedisBroker {
  async fn connect(&self) -> Result<(), BrokerError> {
    let mut state = self.state.lock().await;
    if state.0 == Phase::Open && state.1.is_some() {
      return Ok(());
    }
    let commands = self.client.get_connection_manager().await?;
    let reader = self.client.get_connection_manager().await?;
    debug!(url = %self.url, "Connected to Redis");
    *state = (Phase::Open, Some(Connections { commands, reader }));
    Ok(())
  }

  async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EntryId, BrokerError> {
    let mut conn = self.connections().await?.commands;
    let id: String = conn.xadd(stream, "*", fields).await?;
    Ok(id)
  }

  async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<(), BrokerError> {
    let mut conn = self.connections().await?.commands;
    let created: Result<(), ::redis::RedisError> =
      conn.xgroup_create_mkstream(stream, group, start_id).await;
    match created {
      Ok(()) => Ok(()),
      Err(e) if e.code() == Some("BUSYGROUP") => Err(BrokerError::GroupAlreadyExists {
        stream: stream.to_string(),
        group: group.to_string(),
      }),
      Err(e) => Err(e.into()),
    }
  }

  async fn read_group(
    &self,
    stream: &str,
    group: &str,
    consumer: &str,
    cursor: ReadCursor,
    count: usize,
    block: Duration,
  ) -> Result<Vec<StreamRecord>, BrokerError> {
    let mut conn = self.connections().await?.reader;

    let mut cmd = ::redis::cmd("XREADGROUP");
    cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count.max(1));
    let block_ms = block.as_millis() as u64;
    // BLOCK 0 would wait forever.
    if cursor == ReadCursor::New && block_ms > 0 {
      cmd.arg("BLOCK").arg(block_ms);
    }
    let start = match cursor {
      ReadCursor::New => ">",
      ReadCursor::Pending => "0",
    };
    cmd.arg("STREAMS").arg(stream).arg(start);

    let reply: Option<StreamReadReply> = match cmd.query_async(&mut conn).await {
      Ok(reply) => reply,
      Err(e) if e.code() == Some("NOGROUP") => {
        return Err(BrokerError::NoSuchGroup {
          stream: stream.to_string(),
          group: group.to_string(),
        });
      }
      Err(e) => return Err(e.into()),
    };

    Ok(
      reply
        .into_iter()
        .flat_map(|reply| reply.keys)
        .flat_map(|key| key.ids)
        .map(to_record)
        .collect(),
    )
  }

  async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, BrokerError> {
    if ids.is_empty() {
      return Ok(0);
    }
    let mut conn = self.connections().await?.commands;
    let acked: u64 = conn.xack(stream, group, ids).await?;
    Ok(acked)
  }

  async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError> {
    let mut conn = self.connections().await?.commands;
    let reply: StreamPendingReply = conn.xpending(stream, group).await?;
    Ok(reply.count() as u64)
  }

  async fn claim_stale(
    &self,
    stream: &str,
    group: &str,
    consumer: &str,
    min_idle: Duration,
    count: usize,
  ) -> Result<Vec<StreamRecord>, BrokerError> {
    let mut conn = self.connections().await?.commands;
    let reply: Vec<Value> = ::redis::cmd("XAUTOCLAIM")
      .arg(stream)
      .arg(group)
      .arg(consumer)
      .arg(min_idle.as_millis() as u64)
      .arg("0-0")
      .arg("COUNT")
      .arg(count.max(1))
      .query_async(&mut conn)
      .await?;

    // [next-cursor, entries, deleted-ids]
    let Some(entries) = reply.get(1) else {
      return Err(BrokerError::Protocol(
        "XAUTOCLAIM reply is missing the entry list".to_string(),
      ));
    };
    let range: StreamRangeReply = from_redis_value(entries)?;
    Ok(range.ids.into_iter().map(to_record).collect())
  }

  async fn close(&self) -> Result<(), BrokerError> {
    let mut state = self.state.lock().await;
    *state = (Phase::Closed, None);
    debug!(url = %self.url, "Closed Redis connections");
    Ok(())
  }
}
