//! # Error Handling
//!
//! Typed errors for the distribution layer, split by where they originate:
//!
//! - **[`ConfigError`]**: invalid topology or unreadable configuration. Raised at
//!   construction time and never recovered.
//! - **[`BrokerError`]**: failures reported by a [`Broker`](crate::broker::Broker)
//!   backend. `GroupAlreadyExists` is part of the contract so callers can treat
//!   idempotent group creation as success.
//! - **[`DistributionError`]**: everything the public API can return, including
//!   the terminal `SignalLost` produced once the retry budget is spent and
//!   `BatchInterrupted` for partially submitted batches.
//!
//! Handler failures on the consumer side are opaque [`HandlerError`]s; they are
//! logged by the worker loop and never propagate to callers.

use crate::broker::EntryId;

/// Error returned by a task handler. Opaque to the distribution layer.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Configuration errors detected while building a router or loading settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  /// The stable (ordering-sensitive) pool has no nodes.
  #[error("stable pool must contain at least one node")]
  EmptyStablePool,
  /// The elastic (throughput) pool has no nodes.
  #[error("elastic pool must contain at least one node")]
  EmptyElasticPool,
  /// A node id appears more than once within a pool.
  #[error("duplicate node id `{0}` in topology")]
  DuplicateNode(String),
  /// A node id appears in both the stable and the elastic pool.
  #[error("node `{0}` is listed in both the stable and the elastic pool")]
  OverlappingPools(String),
  /// A category maps to an empty lane subset.
  #[error("category `{0}` has no lanes")]
  EmptyLanes(String),
  /// A category lane is not a member of the elastic pool.
  #[error("category `{category}` references `{node}`, which is not in the elastic pool")]
  ForeignLane {
    /// Category being validated.
    category: String,
    /// Offending node id.
    node: String,
  },
  /// Two categories collide once case is ignored.
  #[error("category `{0}` is defined more than once (names are case-insensitive)")]
  DuplicateCategory(String),
  /// The configuration file could not be read.
  #[error("failed to read configuration: {0}")]
  Io(#[from] std::io::Error),
  /// The configuration document is not valid.
  #[error("invalid configuration: {0}")]
  Parse(#[from] serde_json::Error),
}

/// Errors reported by a broker backend.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
  /// An operation was attempted before `connect`.
  #[error("broker is not connected")]
  NotConnected,
  /// The connection was closed.
  #[error("broker connection closed")]
  Closed,
  /// The consumer group already exists on the stream.
  #[error("consumer group `{group}` already exists on stream `{stream}`")]
  GroupAlreadyExists {
    /// Stream name.
    stream: String,
    /// Group name.
    group: String,
  },
  /// The consumer group does not exist on the stream.
  #[error("consumer group `{group}` does not exist on stream `{stream}`")]
  NoSuchGroup {
    /// Stream name.
    stream: String,
    /// Group name.
    group: String,
  },
  /// The broker could not be reached or refused the request.
  #[error("broker unavailable: {0}")]
  Unavailable(String),
  /// The broker replied with something this layer cannot interpret.
  #[error("unexpected broker reply: {0}")]
  Protocol(String),
  /// Error from the Redis client.
  #[cfg(feature = "redis")]
  #[error("redis error: {0}")]
  Redis(#[from] redis::RedisError),
}

/// Errors surfaced by the public distribution API.
#[derive(Debug, thiserror::Error)]
pub enum DistributionError {
  /// Every attempt to submit a signal failed.
  #[error("signal `{signal_id}` lost after {attempts} attempt(s): {last_error}")]
  SignalLost {
    /// Correlation id of the signal.
    signal_id: String,
    /// Number of attempts made.
    attempts: u32,
    /// Rendered error of the final attempt.
    last_error: String,
  },
  /// A batch stopped part-way; entries in `submitted` are already durable.
  #[error("batch interrupted at task {failed_index} after {} durable submission(s): {source}", .submitted.len())]
  BatchInterrupted {
    /// Entry ids of the tasks appended before the failure, in order.
    submitted: Vec<EntryId>,
    /// Index of the task that failed.
    failed_index: usize,
    /// Failure of that task.
    #[source]
    source: Box<DistributionError>,
  },
  /// Invalid configuration.
  #[error(transparent)]
  Config(#[from] ConfigError),
  /// Broker failure outside the retry wrapper.
  #[error(transparent)]
  Broker(#[from] BrokerError),
  /// A payload could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl DistributionError {
  /// Returns the entry ids that were durably appended before this error, if
  /// the error came from a batch.
  pub fn submitted(&self) -> &[EntryId] {
    match self {
      DistributionError::BatchInterrupted { submitted, .. } => submitted,
      _ => &[],
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_signal_lost_message_names_signal_and_attempts() {
    let err = DistributionError::SignalLost {
      signal_id: "ingest:user-42".to_string(),
      attempts: 4,
      last_error: "connection refused".to_string(),
    };
    let msg = err.to_string();
    assert!(msg.contains("ingest:user-42"));
    assert!(msg.contains("4 attempt"));
    assert!(msg.contains("connection refused"));
  }

  #[test]
  fn test_batch_interrupted_exposes_submitted_ids() {
    let err = DistributionError::BatchInterrupted {
      submitted: vec!["1-0".to_string(), "1-1".to_string()],
      failed_index: 2,
      source: Box::new(DistributionError::Broker(BrokerError::Closed)),
    };
    assert_eq!(err.submitted(), &["1-0".to_string(), "1-1".to_string()]);
    assert!(err.to_string().contains("task 2"));
    assert!(std::error::Error::source(&err).is_some());
  }

  #[test]
  fn test_non_batch_errors_have_no_submitted_ids() {
    let err = DistributionError::Config(ConfigError::EmptyStablePool);
    assert!(err.submitted().is_empty());
  }
}
