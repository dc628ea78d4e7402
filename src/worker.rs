//! # Worker Pool
//!
//! Producer and consumer side of the consumer-group stream.
//!
//! A [`WorkerPool`] appends [`BrokerEntry`]s with
//! [`submit_task`](WorkerPool::submit_task) and, on worker processes, drains the
//! group with [`start_worker`](WorkerPool::start_worker). Delivery is
//! at-least-once: an entry is acknowledged only after its handler returns
//! `Ok`, so a failed or crashed handler leaves it pending for a later
//! [`reclaim_stale`](WorkerPool::reclaim_stale) pass.
//!
//! ## Shutdown
//!
//! [`stop`](WorkerPool::stop) cancels the loop, waits for the batch being
//! dispatched (if any) and closes the broker. The loop notices the stop at its
//! next iteration, which is at most one read timeout away.

use crate::broker::{Broker, EntryId, ReadCursor, StreamRecord};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, DistributionError, HandlerError};
use crate::signal::Payload;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wire field holding the task type.
pub const FIELD_TYPE: &str = "type";
/// Wire field holding the JSON payload.
pub const FIELD_PAYLOAD: &str = "payload";
/// Wire field holding the producer identity.
pub const FIELD_SUBMITTED_BY: &str = "submitted_by";
/// Wire field holding the RFC 3339 submission time.
pub const FIELD_SUBMITTED_AT: &str = "submitted_at";

/// Number of stale entries claimed per reclaim round trip.
const RECLAIM_BATCH: usize = 100;

/// Consumer-side task callback.
#[async_trait]
pub trait TaskHandler: Send + Sync {
  /// Processes one task. `Ok` acknowledges the entry; `Err` leaves it pending.
  async fn handle(&self, task_type: &str, payload: Payload) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> TaskHandler for F
where
  F: Fn(String, Payload) -> Fut + Send + Sync,
  Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
  async fn handle(&self, task_type: &str, payload: Payload) -> Result<(), HandlerError> {
    (self)(task_type.to_string(), payload).await
  }
}

/// A decoded stream entry.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerEntry {
  /// Broker-assigned id.
  pub entry_id: EntryId,
  /// Task type (wire field `type`).
  pub task_type: String,
  /// Decoded payload.
  pub payload: Payload,
  /// Producer identity, when present.
  pub submitted_by: Option<String>,
  /// Submission time, when present and well-formed.
  pub submitted_at: Option<DateTime<Utc>>,
}

impl BrokerEntry {
  /// Encodes the wire fields of a new entry.
  pub fn encode(
    task_type: &str,
    payload: &Payload,
    submitted_by: &str,
    submitted_at: DateTime<Utc>,
  ) -> Result<Vec<(String, String)>, DistributionError> {
    Ok(vec![
      (FIELD_TYPE.to_string(), task_type.to_string()),
      (FIELD_PAYLOAD.to_string(), serde_json::to_string(payload)?),
      (FIELD_SUBMITTED_BY.to_string(), submitted_by.to_string()),
      (FIELD_SUBMITTED_AT.to_string(), submitted_at.to_rfc3339()),
    ])
  }

  /// Decodes a raw record.
  ///
  /// # Errors
  ///
  /// Fails when `type` or `payload` is missing or the payload is not a JSON
  /// object.
  pub fn decode(record: &StreamRecord) -> Result<Self, DistributionError> {
    let field = |name: &str| {
      record.fields.get(name).ok_or_else(|| {
        DistributionError::Broker(BrokerError::Protocol(format!(
          "entry {} has no `{name}` field",
          record.id
        )))
      })
    };
    let task_type = field(FIELD_TYPE)?.clone();
    let payload: Payload = serde_json::from_str(field(FIELD_PAYLOAD)?)?;
    let submitted_at = record
      .fields
      .get(FIELD_SUBMITTED_AT)
      .and_then(|at| DateTime::parse_from_rfc3339(at).ok())
      .map(|at| at.with_timezone(&Utc));

    Ok(Self {
      entry_id: record.id.clone(),
      task_type,
      payload,
      submitted_by: record.fields.get(FIELD_SUBMITTED_BY).cloned(),
      submitted_at,
    })
  }
}

/// Outcome of dispatching one batch of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
  /// Entries handled and acknowledged.
  pub acked: usize,
  /// Entries left pending (handler failure, decode failure or failed ack).
  pub left_pending: usize,
}

/// Producer/consumer endpoint of one consumer group.
pub struct WorkerPool {
  broker: Arc<dyn Broker>,
  config: BrokerConfig,
  consumer_name: String,
  producer_id: String,
  connected: AtomicBool,
  shutdown: std::sync::Mutex<CancellationToken>,
  in_flight: tokio::sync::Mutex<()>,
}

impl WorkerPool {
  /// Creates a pool over `broker`. Nothing is contacted until
  /// [`connect`](Self::connect) or the first submission.
  pub fn new(broker: Arc<dyn Broker>, config: BrokerConfig) -> Self {
    let consumer_name = config.resolved_consumer_name();
    let producer_id = config.resolved_producer_id();
    Self {
      broker,
      config,
      consumer_name,
      producer_id,
      connected: AtomicBool::new(false),
      shutdown: std::sync::Mutex::new(CancellationToken::new()),
      in_flight: tokio::sync::Mutex::new(()),
    }
  }

  /// Unique consumer name within the group.
  pub fn consumer_name(&self) -> &str {
    &self.consumer_name
  }

  /// Identity written to `submitted_by`.
  pub fn producer_id(&self) -> &str {
    &self.producer_id
  }

  /// Broker settings.
  pub fn config(&self) -> &BrokerConfig {
    &self.config
  }

  /// Whether [`connect`](Self::connect) has succeeded since the last stop.
  pub fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  fn shutdown_token(&self) -> CancellationToken {
    self
      .shutdown
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .clone()
  }

  /// Connects and makes sure the consumer group exists.
  ///
  /// The group is created at offset `0`. An existing group is left untouched,
  /// so repeated calls never rewind its cursor. Connecting after
  /// [`stop`](Self::stop) re-arms the pool.
  ///
  /// # Errors
  ///
  /// Propagates any broker error other than "group already exists".
  pub async fn connect(&self) -> Result<(), DistributionError> {
    let stream = self.config.stream.as_str();
    let group = self.config.group.as_str();

    self.broker.connect().await?;
    match self.broker.create_group(stream, group, "0").await {
      Ok(()) => info!(stream, group, "Created consumer group"),
      Err(BrokerError::GroupAlreadyExists { .. }) => {
        debug!(stream, group, "Consumer group already exists")
      }
      Err(e) => return Err(e.into()),
    }

    {
      let mut token = self
        .shutdown
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
      if token.is_cancelled() {
        *token = CancellationToken::new();
      }
    }
    self.connected.store(true, Ordering::SeqCst);
    info!(stream, group, consumer = %self.consumer_name, "Worker pool connected");
    Ok(())
  }

  /// Appends a task to the stream and returns its entry id.
  ///
  /// Connects first when needed.
  pub async fn submit_task(&self, task_type: &str, payload: Payload) -> Result<EntryId, DistributionError> {
    if !self.is_connected() {
      self.connect().await?;
    }
    let fields = BrokerEntry::encode(task_type, &payload, &self.producer_id, Utc::now())?;
    let entry_id = self
      .broker
      .append(&self.config.stream, &fields)
      .await
      .inspect_err(|e| self.note_broker_error(e))?;
    debug!(stream = %self.config.stream, entry_id = %entry_id, task_type, "Submitted task");
    Ok(entry_id)
  }

  /// Consumes the group until [`stop`](Self::stop) is called.
  ///
  /// Entries still pending for this consumer from an earlier run are
  /// dispatched first. Broker errors never end the loop: they are logged and
  /// followed by a pause of `error_backoff_ms`.
  pub async fn start_worker<H: TaskHandler>(&self, handler: H) {
    let token = self.shutdown_token();
    let stream = self.config.stream.as_str();
    let group = self.config.group.as_str();
    let consumer = self.consumer_name.as_str();
    let mut replay_pending = true;
    info!(stream, group, consumer, "Worker loop started");

    loop {
      if token.is_cancelled() {
        break;
      }

      if !self.is_connected() {
        if let Err(e) = self.connect().await {
          warn!(stream, group, consumer, error = %e, "Failed to connect, backing off");
          if self.pause(&token).await {
            break;
          }
          continue;
        }
      }

      if replay_pending {
        match self.replay_pending(&handler).await {
          Ok(replayed) => {
            if replayed > 0 {
              info!(stream, group, consumer, replayed, "Replayed pending entries");
            }
            replay_pending = false;
          }
          Err(e) => {
            self.note_broker_error(&e);
            warn!(stream, group, consumer, error = %e, "Failed to replay pending entries, backing off");
            if self.pause(&token).await {
              break;
            }
            continue;
          }
        }
      }

      let records = match self
        .broker
        .read_group(
          stream,
          group,
          consumer,
          ReadCursor::New,
          self.config.read_count,
          self.config.block_timeout(),
        )
        .await
      {
        Ok(records) => records,
        Err(e) => {
          if token.is_cancelled() {
            break;
          }
          self.note_broker_error(&e);
          warn!(stream, group, consumer, error = %e, "Failed to read from stream, backing off");
          if self.pause(&token).await {
            break;
          }
          continue;
        }
      };

      if records.is_empty() {
        continue;
      }

      // Delivered entries are dispatched even when a stop is pending.
      let _in_flight = self.in_flight.lock().await;
      self.dispatch(&handler, records).await;
    }

    info!(stream, group, consumer, "Worker loop stopped");
  }

  /// Stops the worker loop and closes the broker connection.
  ///
  /// Waits for a batch being dispatched to finish first.
  pub async fn stop(&self) -> Result<(), DistributionError> {
    self.shutdown_token().cancel();
    let _in_flight = self.in_flight.lock().await;
    self.connected.store(false, Ordering::SeqCst);
    self.broker.close().await?;
    info!(consumer = %self.consumer_name, "Worker pool stopped");
    Ok(())
  }

  /// Number of delivered but unacknowledged entries in the group.
  pub async fn pending_count(&self) -> Result<u64, DistributionError> {
    Ok(
      self
        .broker
        .pending_count(&self.config.stream, &self.config.group)
        .await?,
    )
  }

  /// Entries delivered to this consumer and not yet acknowledged.
  pub async fn pending_entries(&self) -> Result<Vec<StreamRecord>, DistributionError> {
    Ok(
      self
        .broker
        .read_group(
          &self.config.stream,
          &self.config.group,
          &self.consumer_name,
          ReadCursor::Pending,
          self.config.read_count,
          Duration::ZERO,
        )
        .await?,
    )
  }

  /// Claims entries pending for at least `min_idle` and dispatches them once.
  ///
  /// Claimed entries follow the usual rule: acknowledged on success, left
  /// pending (now owned by this consumer) otherwise.
  pub async fn reclaim_stale<H: TaskHandler + ?Sized>(
    &self,
    handler: &H,
    min_idle: Duration,
  ) -> Result<DispatchReport, DistributionError> {
    if !self.is_connected() {
      self.connect().await?;
    }
    let records = self
      .broker
      .claim_stale(
        &self.config.stream,
        &self.config.group,
        &self.consumer_name,
        min_idle,
        RECLAIM_BATCH,
      )
      .await
      .inspect_err(|e| self.note_broker_error(e))?;
    if records.is_empty() {
      return Ok(DispatchReport::default());
    }

    info!(
      consumer = %self.consumer_name,
      count = records.len(),
      min_idle_ms = min_idle.as_millis() as u64,
      "Reclaimed stale entries"
    );
    let _in_flight = self.in_flight.lock().await;
    Ok(self.dispatch(handler, records).await)
  }

  /// Dispatches entries already delivered to this consumer, page by page,
  /// until a page leaves something pending or the list is drained.
  async fn replay_pending<H: TaskHandler + ?Sized>(&self, handler: &H) -> Result<usize, BrokerError> {
    let page = self.config.read_count.max(1);
    let mut replayed = 0;
    loop {
      let records = self
        .broker
        .read_group(
          &self.config.stream,
          &self.config.group,
          &self.consumer_name,
          ReadCursor::Pending,
          page,
          Duration::ZERO,
        )
        .await?;
      if records.is_empty() {
        return Ok(replayed);
      }
      let fetched = records.len();
      let _in_flight = self.in_flight.lock().await;
      let report = self.dispatch(handler, records).await;
      replayed += report.acked;
      if report.left_pending > 0 || fetched < page {
        return Ok(replayed);
      }
    }
  }

  /// Marks the pool disconnected when `error` means the connection or group
  /// is gone, so the next call reconnects.
  fn note_broker_error(&self, error: &BrokerError) {
    if matches!(
      error,
      BrokerError::NotConnected | BrokerError::Closed | BrokerError::NoSuchGroup { .. }
    ) {
      self.connected.store(false, Ordering::SeqCst);
    }
  }

  async fn dispatch<H: TaskHandler + ?Sized>(&self, handler: &H, records: Vec<StreamRecord>) -> DispatchReport {
    let stream = self.config.stream.as_str();
    let group = self.config.group.as_str();
    let mut report = DispatchReport::default();

    for record in records {
      let entry = match BrokerEntry::decode(&record) {
        Ok(entry) => entry,
        Err(e) => {
          error!(stream, entry_id = %record.id, error = %e, "Failed to decode entry, leaving it pending");
          report.left_pending += 1;
          continue;
        }
      };

      if let Err(e) = handler.handle(&entry.task_type, entry.payload).await {
        error!(
          stream,
          entry_id = %entry.entry_id,
          task_type = %entry.task_type,
          error = %e,
          "Task handler failed, leaving entry pending"
        );
        report.left_pending += 1;
        continue;
      }

      match self
        .broker
        .ack(stream, group, std::slice::from_ref(&entry.entry_id))
        .await
      {
        Ok(_) => {
          debug!(stream, entry_id = %entry.entry_id, task_type = %entry.task_type, "Acknowledged entry");
          report.acked += 1;
        }
        Err(e) => {
          warn!(stream, entry_id = %entry.entry_id, error = %e, "Failed to acknowledge entry");
          report.left_pending += 1;
        }
      }
    }
    report
  }

  /// Sleeps for the error back-off. Returns `true` when cancelled meanwhile.
  async fn pause(&self, token: &CancellationToken) -> bool {
    tokio::select! {
      _ = token.cancelled() => true,
      _ = tokio::time::sleep(self.config.error_backoff()) => false,
    }
  }
}

impl std::fmt::Debug for WorkerPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WorkerPool")
      .field("stream", &self.config.stream)
      .field("group", &self.config.group)
      .field("consumer_name", &self.consumer_name)
      .field("connected", &self.is_connected())
      .finish_non_exhaustive()
  }
}
