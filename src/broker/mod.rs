//! # Log Broker Abstraction
//!
//! The distribution layer talks to an append-only, partitioned log through the
//! [`Broker`] trait. It needs a handful of primitives and nothing
//! broker-specific beyond them:
//!
//! - **append** an entry and receive a broker-assigned, monotonically ordered id;
//! - **create a consumer group** idempotently (an existing group is reported as
//!   [`BrokerError::GroupAlreadyExists`]);
//! - **read for a consumer**, either entries never delivered to the group
//!   ([`ReadCursor::New`]) or the consumer's own pending entries
//!   ([`ReadCursor::Pending`]), blocking for a bounded time;
//! - **acknowledge** entries, removing them from the pending list;
//! - **close** the connection;
//! - inspect the **pending count** and **claim stale** pending entries so a
//!   reclaim pass can redeliver work abandoned by crashed consumers.
//!
//! Two backends ship with the crate: [`InMemoryBroker`] and, behind the
//! `redis` feature, [`RedisBroker`] on top of Redis Streams.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_streams;

pub use memory::InMemoryBroker;
#[cfg(feature = "redis")]
pub use redis_streams::RedisBroker;

use crate::error::BrokerError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// Broker-assigned entry identifier (`"<millis>-<sequence>"`).
pub type EntryId = String;

/// A raw entry as stored by the broker: an id and flat string fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRecord {
  /// Entry id.
  pub id: EntryId,
  /// Entry fields.
  pub fields: HashMap<String, String>,
}

/// Which entries a consumer-group read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
  /// Entries not yet delivered to any consumer of the group (`>`).
  New,
  /// Entries delivered to this consumer and not yet acknowledged (`0`).
  Pending,
}

/// Minimal contract of a consumer-group log broker.
///
/// Implementations must be safe to share between the producer path and a
/// consumer loop running on other tasks.
#[async_trait]
pub trait Broker: Send + Sync {
  /// Establishes the connection. Calling it again on a live connection is a no-op.
  async fn connect(&self) -> Result<(), BrokerError>;

  /// Appends an entry to `stream`, creating the stream when missing.
  async fn append(&self, stream: &str, fields: &[(String, String)]) -> Result<EntryId, BrokerError>;

  /// Creates `group` on `stream` starting at `start_id` (`"0"` for the
  /// beginning, `"$"` for new entries only), creating the stream when missing.
  ///
  /// Returns [`BrokerError::GroupAlreadyExists`] when the group exists; the
  /// existing cursor is left untouched.
  async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> Result<(), BrokerError>;

  /// Reads up to `count` entries for `consumer`.
  ///
  /// With [`ReadCursor::New`] the call blocks for at most `block` when nothing
  /// is available and returns an empty batch on timeout. Entries returned this
  /// way become pending for `consumer`. [`ReadCursor::Pending`] returns
  /// immediately.
  async fn read_group(
    &self,
    stream: &str,
    group: &str,
    consumer: &str,
    cursor: ReadCursor,
    count: usize,
    block: Duration,
  ) -> Result<Vec<StreamRecord>, BrokerError>;

  /// Acknowledges entries; returns how many were pending.
  async fn ack(&self, stream: &str, group: &str, ids: &[EntryId]) -> Result<u64, BrokerError>;

  /// Number of delivered but unacknowledged entries of `group`.
  async fn pending_count(&self, stream: &str, group: &str) -> Result<u64, BrokerError>;

  /// Transfers up to `count` entries pending for at least `min_idle` to
  /// `consumer` and returns them.
  async fn claim_stale(
    &self,
    stream: &str,
    group: &str,
    consumer: &str,
    min_idle: Duration,
    count: usize,
  ) -> Result<Vec<StreamRecord>, BrokerError>;

  /// Closes the connection.
  async fn close(&self) -> Result<(), BrokerError>;
}
