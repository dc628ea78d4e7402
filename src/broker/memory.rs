//! In-process broker with consumer-group semantics.
//!
//! Keeps every stream in memory and reproduces the behavior the worker pool
//! relies on: monotonically ordered ids, a per-group delivery cursor,
//! per-consumer pending lists with delivery counts, bounded blocking reads and
//! stale-entry claims. Useful for tests and single-process deployments.
//!
//! Transient unavailability can be simulated with
//! [`InMemoryBroker::fail_next_appends`] and [`InMemoryBroker::fail_next_reads`].

use super::{Broker, EntryId, ReadCursor, StreamRecord};
use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

/// Connection state of the in-memory broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  /// `connect` has not been called yet.
  Disconnected,
  /// Connection is active.
  Connected,
  /// Connection was closed.
  Closed,
}

#[derive(Debug)]
struct PendingEntry {
  consumer: String,
  delivered_at: Instant,
  deliveries: u32,
}

#[derive(Debug, Default)]
struct GroupState {
  /// Index of the first entry never delivered to this group.
  next_index: usize,
  /// Pending entries keyed by entry index.
  pending: BTreeMap<usize, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
  entries: Vec<StreamRecord>,
  index: HashMap<EntryId, usize>,
  last_ms: u64,
  last_seq: u64,
  groups: HashMap<String, GroupState>,
}

impl StreamState {
  fn next_id(&mut self) -> EntryId {
    let now = SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map(|d| d.as_millis() as u64)
      .unwrap_or_default();
    if now > self.last_ms {
      self.last_ms = now;
      self.last_seq = 0;
    } else {
      self.last_seq += 1;
    }
    format!("{}-{}", self.last_ms, self.last_seq)
  }

  fn start_index(&self, start_id: &str) -> usize {
    match start_id {
      "0" | "0-0" => 0,
      "$" => self.entries.len(),
      id => self
        .index
        .get(id)
        .map(|i| i + 1)
        .unwrap_or(self.entries.len()),
    }
  }
}

#[derive(Debug)]
struct State {
  connection: ConnectionState,
  streams: HashMap<String, StreamState>,
}

impl State {
  fn ensure_connected(&self) -> Result<(), BrokerError> {
    match self.connection {
      ConnectionState::Connected => Ok(()),
      ConnectionState::Disconnected => Err(BrokerError::NotConnected),
      ConnectionState::Closed => Err(BrokerError::Closed),
    }
  }
}

/// In-memory [`Broker`] implementation.
#[derive(Debug)]
pub struct InMemoryBroker {
  state: Mutex<State>,
  appended: Notify,
  failing_appends: AtomicU32,
  failing_reads: AtomicU32,
}

impl Default for InMemoryBroker {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryBroker {
  /// Creates an empty, disconnected broker.
  pub fn new() -> Self {
    Self {
      state: Mutex::new(State {
        connection: ConnectionState::Disconnected,
        streams: HashMap::new(),
      }),
      appended: Notify::new(),
      failing_appends: AtomicU32::new(0),
      failing_reads: AtomicU32::new(0),
    }
  }

  /// Makes the next `n` appends fail with [`BrokerError::Unavailable`].
  pub fn fail_next_appends(&self, n: u32) {
    self.failing_appends.store(n, Ordering::SeqCst);
  }

  /// Makes the next `n` group reads fail with [`BrokerError::Unavailable`].
  pub fn fail_next_reads(&self, n: u32) {
    self.failing_reads.store(n, Ordering::SeqCst);
  }

  /// Current connection state.
  pub async fn connection_state(&self) -> ConnectionState {
    self.state.lock().await.connection
  }

  /// All entries of `stream` in append order.
  pub async fn entries(&self, stream: &str) -> Vec<StreamRecord> {
    self
      .state
      .lock()
      .await
      .streams
      .get(stream)
      .map(|s| s.entries.clone())
      .unwrap_or_default()
  }

  /// Number of entries in `stream`.
  pub async fn len(&self, stream: &str) -> usize {
    self
      .state
      .lock()
      .await
      .streams
      .get(stream)
      .map_or(0, |s| s.entries.len())
  }

  /// Returns `true` when `stream` has no entries.
  pub async fn is_empty(&self, stream: &str) -> bool {
    self.len(stream).await == 0
  }

  /// How many times entry `id` has been delivered to `group`, if pending.
  pub async fn delivery_count(&self, stream: &str, group: &str, id: &str) -> Option<u32> {
    let state = self.state.lock().await;
    let stream = state.streams.get(stream)?;
    let index = stream.index.get(id)?;
    stream
      .groups
      .get(group)?
      .pending
      .get(index)
      .map(|p| p.deliveries)
  }

  /// Consumer currently owning pending entry `id` of `group`.
  pub async fn pending_owner(&self, stream: &str, group: &str, id: &str) -> Option<String> {
    let state = self.state.lock().await;
    let stream = state.streams.get(stream)?;
    let index = stream.index.get(id)?;
    stream
      .groups
      .get(group)?
      .pending
      .get(index)
      .map(|p| p.consumer.clone())
  }

  fn take_failure(counter: &AtomicU32) -> bool {
    counter
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
  }

  fn group_mut<'a>(
    state: &'a mut State,
    stream: &str,
    group: &str,
  ) -> Result<(&'a [StreamRecord], &'a mut GroupState), BrokerError> {
    let no_group = || BrokerError::NoSuchGroup {
      stream: stream.to_string(),
      group: group.to_string(),
    };
    let stream_state = state.streams.get_mut(stream).ok_or_else(no_group)?;
    let group_state = stream_state.groups.get_mut(group).ok_or_else(no_group)?;
    Ok((&stream_state.entries, group_state))
  }
}

#[async_trait]
impl Broker for InMemoryBroker {
  async fn connect(&self) -> Result<(), BrokerError> {
    self.state.lock().await.connection = ConnectionState::Connected;
    Ok(())
  }

  async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EntryId, BrokerError> {
    let mut state = self.state.lock().await;
    state.ensure_connected()?;
    if Self::take_failure(&self.failing_appends) {
      return Err(BrokerError::Unavailable("simulated append failure".to_string()));
    }

    let stream_state = state.streams.entry(stream.to_string()).or_default();
    let id = stream_state.next_id();
    stream_state.index.insert(id.clone(), stream_state.entries.len());
    stream_state.entries.push(StreamRecord {
      id: id.clone(),
      fields: fields.iter().cloned().collect(),
    });
    drop(state);

    self.appended.notify_waiters();
    Ok(id)
  }

  async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<(), BrokerError> {
    let mut state = self.state.lock().await;
    state.ensure_connected()?;
    let stream_state = state.streams.entry(stream.to_string()).or_default();
    if stream_state.groups.contains_key(group) {
      return Err(BrokerError::GroupAlreadyExists {
        stream: stream.to_string(),
        group: group.to_string(),
      });
    }
    let next_index = stream_state.start_index(start_id);
    stream_state.groups.insert(
      group.to_string(),
      GroupState {
        next_index,
        pending: BTreeMap::new(),
      },
    );
    Ok(())
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
    let count = count.max(1);
    let deadline = Instant::now() + block;

    loop {
      let notified = self.appended.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      {
        let mut state = self.state.lock().await;
        state.ensure_connected()?;
        if Self::take_failure(&self.failing_reads) {
          return Err(BrokerError::Unavailable("simulated read failure".to_string()));
        }
        let (entries, group_state) = Self::group_mut(&mut state, stream, group)?;
        let now = Instant::now();

        match cursor {
          ReadCursor::Pending => {
            let mut batch = Vec::new();
            for (index, pending) in group_state.pending.iter_mut() {
              if batch.len() == count {
                break;
              }
              if pending.consumer == consumer {
                pending.delivered_at = now;
                pending.deliveries += 1;
                batch.push(entries[*index].clone());
              }
            }
            return Ok(batch);
          }
          ReadCursor::New => {
            if group_state.next_index < entries.len() {
              let end = (group_state.next_index + count).min(entries.len());
              let batch = entries[group_state.next_index..end].to_vec();
              for index in group_state.next_index..end {
                group_state.pending.insert(
                  index,
                  PendingEntry {
                    consumer: consumer.to_string(),
                    delivered_at: now,
                    deliveries: 1,
                  },
                );
              }
              group_state.next_index = end;
              return Ok(batch);
            }
          }
        }
      }

      let remaining = deadline.saturating_duration_since(Instant::now());
      if remaining.is_zero() || tokio::time::timeout(remaining, notified).await.is_err() {
        return Ok(Vec::new());
      }
    }
  }

  async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, BrokerError> {
    let mut state = self.state.lock().await;
    state.ensure_connected()?;
    let Some(stream_state) = state.streams.get_mut(stream) else {
      return Ok(0);
    };
    let Some(group_state) = stream_state.groups.get_mut(group) else {
      return Ok(0);
    };
    let acked = ids
      .iter()
      .filter_map(|id| stream_state.index.get(id))
      .filter(|index| group_state.pending.remove(*index).is_some())
      .count();
    Ok(acked as u64)
  }

  async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError> {
    let mut state = self.state.lock().await;
    state.ensure_connected()?;
    let (_, group_state) = Self::group_mut(&mut state, stream, group)?;
    Ok(group_state.pending.len() as u64)
  }

  async fn claim_stale(
    &self,
    stream: &str,
    group: &str,
    consumer: &str,
    min_idle: Duration,
    count: usize,
  ) -> Result<Vec<StreamRecord>, BrokerError> {
    let mut state = self.state.lock().await;
    state.ensure_connected()?;
    let (entries, group_state) = Self::group_mut(&mut state, stream, group)?;
    let now = Instant::now();

    let mut claimed = Vec::new();
    for (index, pending) in group_state.pending.iter_mut() {
      if claimed.len() == count.max(1) {
        break;
      }
      if now.saturating_duration_since(pending.delivered_at) >= min_idle {
        pending.consumer = consumer.to_string();
        pending.delivered_at = now;
        pending.deliveries += 1;
        claimed.push(entries[*index].clone());
      }
    }
    Ok(claimed)
  }

  async fn close(&self) -> Result<(), BrokerError> {
    self.state.lock().await.connection = ConnectionState::Closed;
    self.appended.notify_waiters();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;

  const STREAM: &str = "signals";
  const GROUP: &str = "workers";

  fn fields(task: &str) -> Vec<(String, String)> {
    vec![("type".to_string(), task.to_string())]
  }

  async fn connected() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.connect().await.unwrap();
    broker
  }

  #[tokio::test]
  async fn test_operations_require_connection() {
    let broker = InMemoryBroker::new();
    assert!(matches!(
      broker.append(STREAM, &fields("a")).await,
      Err(BrokerError::NotConnected)
    ));
    broker.connect().await.unwrap();
    broker.close().await.unwrap();
    assert!(matches!(
      broker.append(STREAM, &fields("a")).await,
      Err(BrokerError::Closed)
    ));
    assert_eq!(broker.connection_state().await, ConnectionState::Closed);
  }

  #[tokio::test]
  async fn test_ids_are_monotonic() {
    let broker = connected().await;
    let mut previous = (0u64, 0u64);
    for _ in 0..50 {
      let id = broker.append(STREAM, &fields("a")).await.unwrap();
      let (ms, seq) = id.split_once('-').unwrap();
      let current = (ms.parse().unwrap(), seq.parse().unwrap());
      assert!(current > previous);
      previous = current;
    }
  }

  #[tokio::test]
  async fn test_create_group_reports_existing_group() {
    let broker = connected().await;
    broker.create_group(STREAM, GROUP, "0").await.unwrap();
    assert!(matches!(
      broker.create_group(STREAM, GROUP, "0").await,
      Err(BrokerError::GroupAlreadyExists { .. })
    ));
  }

  #[tokio::test]
  async fn test_group_start_offsets() {
    let broker = connected().await;
    broker.append(STREAM, &fields("old")).await.unwrap();
    broker.create_group(STREAM, "from-start", "0").await.unwrap();
    broker.create_group(STREAM, "from-now", "$").await.unwrap();
    broker.append(STREAM, &fields("new")).await.unwrap();

    let all = broker
      .read_group(STREAM, "from-start", "c", ReadCursor::New, 10, Duration::ZERO)
      .await
      .unwrap();
    let fresh = broker
      .read_group(STREAM, "from-now", "c", ReadCursor::New, 10, Duration::ZERO)
      .await
      .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(fresh.len(), 1);
    assert_eq!(fresh[0].fields["type"], "new");
  }

  #[tokio::test]
  async fn test_entries_go_to_one_consumer_only() {
    let broker = connected().await;
    broker.create_group(STREAM, GROUP, "0").await.unwrap();
    for i in 0..4 {
      broker.append(STREAM, &fields(&format!("t{i}"))).await.unwrap();
    }

    let first = broker
      .read_group(STREAM, GROUP, "c1", ReadCursor::New, 2, Duration::ZERO)
      .await
      .unwrap();
    let second = broker
      .read_group(STREAM, GROUP, "c2", ReadCursor::New, 10, Duration::ZERO)
      .await
      .unwrap();
    let third = broker
      .read_group(STREAM, GROUP, "c1", ReadCursor::New, 10, Duration::ZERO)
      .await
      .unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    assert!(third.is_empty());
    assert_ne!(first[0].id, second[0].id);
    assert_eq!(broker.pending_count(STREAM, GROUP).await.unwrap(), 4);
  }

  #[tokio::test]
  async fn test_unacked_entries_stay_pending_for_their_consumer() {
    let broker = connected().await;
    broker.create_group(STREAM, GROUP, "0").await.unwrap();
    let id = broker.append(STREAM, &fields("a")).await.unwrap();

    broker
      .read_group(STREAM, GROUP, "c1", ReadCursor::New, 10, Duration::ZERO)
      .await
      .unwrap();

    let mine = broker
      .read_group(STREAM, GROUP, "c1", ReadCursor::Pending, 10, Duration::ZERO)
      .await
      .unwrap();
    let theirs = broker
      .read_group(STREAM, GROUP, "c2", ReadCursor::Pending, 10, Duration::ZERO)
      .await
      .unwrap();
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].id, id);
    assert!(theirs.is_empty());
    assert_eq!(broker.delivery_count(STREAM, GROUP, &id).await, Some(2));

    assert_eq!(broker.ack(STREAM, GROUP, &[id.clone()]).await.unwrap(), 1);
    assert_eq!(broker.ack(STREAM, GROUP, &[id.clone()]).await.unwrap(), 0);
    assert_eq!(broker.pending_count(STREAM, GROUP).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_blocking_read_times_out_empty() {
    let broker = connected().await;
    broker.create_group(STREAM, GROUP, "0").await.unwrap();
    let started = Instant::now();
    let batch = broker
      .read_group(STREAM, GROUP, "c1", ReadCursor::New, 10, Duration::from_millis(50))
      .await
      .unwrap();
    assert!(batch.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(50));
  }

  #[tokio::test]
  async fn test_blocking_read_wakes_on_append() {
    let broker = Arc::new(connected().await);
    broker.create_group(STREAM, GROUP, "0").await.unwrap();

    let reader = {
      let broker = broker.clone();
      tokio::spawn(async move {
        broker
          .read_group(STREAM, GROUP, "c1", ReadCursor::New, 10, Duration::from_secs(5))
          .await
      })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    broker.append(STREAM, &fields("late")).await.unwrap();

    let batch = tokio::time::timeout(Duration::from_secs(1), reader)
      .await
      .expect("reader should wake before its block timeout")
      .unwrap()
      .unwrap();
    assert_eq!(batch.len(), 1);
  }

  #[tokio::test]
  async fn test_claim_stale_moves_idle_entries() {
    let broker = connected().await;
    broker.create_group(STREAM, GROUP, "0").await.unwrap();
    let id = broker.append(STREAM, &fields("a")).await.unwrap();
    broker
      .read_group(STREAM, GROUP, "crashed", ReadCursor::New, 10, Duration::ZERO)
      .await
      .unwrap();

    let too_fresh = broker
      .claim_stale(STREAM, GROUP, "rescuer", Duration::from_secs(60), 10)
      .await
      .unwrap();
    assert!(too_fresh.is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    let claimed = broker
      .claim_stale(STREAM, GROUP, "rescuer", Duration::from_millis(10), 10)
      .await
      .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(
      broker.pending_owner(STREAM, GROUP, &id).await.as_deref(),
      Some("rescuer")
    );
  }

  #[tokio::test]
  async fn test_simulated_failures_are_consumed() {
    let broker = connected().await;
    broker.create_group(STREAM, GROUP, "0").await.unwrap();
    broker.fail_next_appends(2);
    assert!(broker.append(STREAM, &fields("a")).await.is_err());
    assert!(broker.append(STREAM, &fields("a")).await.is_err());
    assert!(broker.append(STREAM, &fields("a")).await.is_ok());

    broker.fail_next_reads(1);
    assert!(
      broker
        .read_group(STREAM, GROUP, "c", ReadCursor::New, 1, Duration::ZERO)
        .await
        .is_err()
    );
    assert_eq!(broker.len(STREAM).await, 1);
  }

  #[tokio::test]
  async fn test_read_unknown_group_fails() {
    let broker = connected().await;
    assert!(matches!(
      broker
        .read_group(STREAM, "ghost", "c", ReadCursor::New, 1, Duration::ZERO)
        .await,
      Err(BrokerError::NoSuchGroup { .. })
    ));
  }
}
