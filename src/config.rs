//! # Configuration
//!
//! All inputs of the distribution layer are supplied at construction time
//! through a [`DistributionConfig`]. It can be assembled with the `with_*`
//! builders or loaded from a JSON document; every field has a default except
//! the node pools, which must be configured before a
//! [`Router`](crate::router::Router) can be built.
//!
//! ```rust
//! use taskweave::config::{DistributionConfig, TopologyConfig};
//!
//! let config = DistributionConfig::default()
//!   .with_connection_url("redis://cache:6379")
//!   .with_stream("signals")
//!   .with_group("workers")
//!   .with_topology(
//!     TopologyConfig::default()
//!       .with_stable_pool(["railway-0", "railway-1"])
//!       .with_elastic_pool(["freeway-0", "freeway-1", "freeway-2"])
//!       .with_category("arena", ["freeway-1", "freeway-2"]),
//!   );
//! assert_eq!(config.broker.stream, "signals");
//! ```
//!
//! The JSON form mirrors the struct layout:
//!
//! ```json
//! {
//!   "broker": { "connection_url": "redis://cache:6379", "stream": "signals" },
//!   "topology": {
//!     "stable_pool": ["railway-0", "railway-1"],
//!     "elastic_pool": ["freeway-0", "freeway-1", "freeway-2"],
//!     "categories": { "arena": ["freeway-1", "freeway-2"] }
//!   },
//!   "retry": { "retries": 4, "decay": 1.155 }
//! }
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Shortest blocking read the worker loop issues, in milliseconds.
///
/// A zero timeout would turn an idle worker into a busy loop.
pub const MIN_BLOCK_MS: u64 = 10;

/// Connection and consumer settings for the log broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
  /// Broker connection URL (e.g. `redis://localhost:6379`).
  pub connection_url: String,
  /// Stream (log) name entries are appended to.
  pub stream: String,
  /// Consumer group shared by cooperating workers.
  pub group: String,
  /// Consumer name within the group. Derived from the host name when unset.
  pub consumer_name: Option<String>,
  /// Producer identity stamped on every entry. Defaults to the consumer name.
  pub producer_id: Option<String>,
  /// Upper bound of a blocking read, in milliseconds. Values below
  /// [`MIN_BLOCK_MS`] are raised to it.
  pub block_ms: u64,
  /// Maximum number of entries fetched per read.
  pub read_count: usize,
  /// Pause after a failed read before the worker loop retries, in milliseconds.
  pub error_backoff_ms: u64,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    Self {
      connection_url: "redis://localhost:6379".to_string(),
      stream: "taskweave:signals".to_string(),
      group: "taskweave-workers".to_string(),
      consumer_name: None,
      producer_id: None,
      block_ms: 5000,
      read_count: 10,
      error_backoff_ms: 1000,
    }
  }
}

impl BrokerConfig {
  /// Read timeout as a [`Duration`], never shorter than [`MIN_BLOCK_MS`].
  pub fn block_timeout(&self) -> Duration {
    Duration::from_millis(self.block_ms.max(MIN_BLOCK_MS))
  }

  /// Worker back-off after read errors as a [`Duration`].
  pub fn error_backoff(&self) -> Duration {
    Duration::from_millis(self.error_backoff_ms)
  }

  /// Consumer name: the configured one, or the host name.
  pub fn resolved_consumer_name(&self) -> String {
    self.consumer_name.clone().unwrap_or_else(host_identity)
  }

  /// Producer identity: the configured one, or the consumer name.
  pub fn resolved_producer_id(&self) -> String {
    self
      .producer_id
      .clone()
      .unwrap_or_else(|| self.resolved_consumer_name())
  }
}

/// Static node topology: the two pools and the category lanes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
  /// Ordering-sensitive pool ("railway").
  pub stable_pool: Vec<String>,
  /// Throughput pool ("freeway").
  pub elastic_pool: Vec<String>,
  /// Category name to a subset of the elastic pool.
  pub categories: BTreeMap<String, Vec<String>>,
}

impl TopologyConfig {
  /// Sets the stable pool.
  #[must_use]
  pub fn with_stable_pool<I, S>(mut self, nodes: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.stable_pool = nodes.into_iter().map(Into::into).collect();
    self
  }

  /// Sets the elastic pool.
  #[must_use]
  pub fn with_elastic_pool<I, S>(mut self, nodes: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.elastic_pool = nodes.into_iter().map(Into::into).collect();
    self
  }

  /// Adds (or replaces) a category lane subset.
  #[must_use]
  pub fn with_category<I, S>(mut self, category: impl Into<String>, lanes: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self
      .categories
      .insert(category.into(), lanes.into_iter().map(Into::into).collect());
    self
  }
}

/// Bounded exponential back-off with jitter used by
/// [`SignalProcessor::echo`](crate::processor::SignalProcessor::echo).
///
/// After failed attempt `n` (0-based) the processor sleeps
/// `delay_unit * decay^n + uniform(0, max_jitter)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Total number of attempts.
  pub retries: u32,
  /// Exponential base of the back-off.
  pub decay: f64,
  /// Length of one back-off unit, in milliseconds.
  pub delay_unit_ms: u64,
  /// Upper bound of the random jitter, in milliseconds.
  pub max_jitter_ms: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      retries: 4,
      decay: 1.155,
      delay_unit_ms: 1000,
      max_jitter_ms: 200,
    }
  }
}

impl RetryPolicy {
  /// Sets the total number of attempts.
  #[must_use]
  pub fn with_retries(mut self, retries: u32) -> Self {
    self.retries = retries;
    self
  }

  /// Sets the exponential base.
  #[must_use]
  pub fn with_decay(mut self, decay: f64) -> Self {
    self.decay = decay;
    self
  }

  /// Sets the back-off unit.
  #[must_use]
  pub fn with_delay_unit(mut self, unit: Duration) -> Self {
    self.delay_unit_ms = unit.as_millis() as u64;
    self
  }

  /// Sets the jitter upper bound.
  #[must_use]
  pub fn with_max_jitter(mut self, jitter: Duration) -> Self {
    self.max_jitter_ms = jitter.as_millis() as u64;
    self
  }

  /// Attempts actually made; a zero budget still makes one attempt.
  pub fn attempts(&self) -> u32 {
    self.retries.max(1)
  }

  /// Deterministic part of the back-off after failed attempt `attempt`.
  pub fn base_delay(&self, attempt: u32) -> Duration {
    let factor = self.decay.powi(attempt as i32);
    let millis = self.delay_unit_ms as f64 * factor;
    if millis.is_finite() && millis > 0.0 {
      Duration::from_secs_f64(millis / 1000.0)
    } else {
      Duration::ZERO
    }
  }

  /// Jitter upper bound as a [`Duration`].
  pub fn max_jitter(&self) -> Duration {
    Duration::from_millis(self.max_jitter_ms)
  }
}

/// Tunables of payload enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
  /// Multiplier applied to the reverb size to obtain `reverb_depth`.
  pub depth_bias: f64,
}

impl Default for EnrichmentConfig {
  fn default() -> Self {
    Self { depth_bias: 1.05 }
  }
}

/// Complete configuration of a [`DistributionManager`](crate::distribution::DistributionManager).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributionConfig {
  /// Broker connection and consumer settings.
  pub broker: BrokerConfig,
  /// Node pools and category lanes.
  pub topology: TopologyConfig,
  /// Submission retry policy.
  pub retry: RetryPolicy,
  /// Enrichment tunables.
  pub enrichment: EnrichmentConfig,
  /// Reverb size used by batches when the caller does not pass one.
  pub batch_reverb_size: f64,
}

impl Default for DistributionConfig {
  fn default() -> Self {
    Self {
      broker: BrokerConfig::default(),
      topology: TopologyConfig::default(),
      retry: RetryPolicy::default(),
      enrichment: EnrichmentConfig::default(),
      batch_reverb_size: 1.2,
    }
  }
}

impl DistributionConfig {
  /// Parses a configuration from a JSON document.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(json)?)
  }

  /// Loads a configuration from a JSON file.
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Self::from_json_str(&raw)
  }

  /// Sets the broker connection URL.
  #[must_use]
  pub fn with_connection_url(mut self, url: impl Into<String>) -> Self {
    self.broker.connection_url = url.into();
    self
  }

  /// Sets the stream name.
  #[must_use]
  pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
    self.broker.stream = stream.into();
    self
  }

  /// Sets the consumer group name.
  #[must_use]
  pub fn with_group(mut self, group: impl Into<String>) -> Self {
    self.broker.group = group.into();
    self
  }

  /// Overrides the consumer name.
  #[must_use]
  pub fn with_consumer_name(mut self, name: impl Into<String>) -> Self {
    self.broker.consumer_name = Some(name.into());
    self
  }

  /// Sets the blocking read timeout in milliseconds.
  #[must_use]
  pub fn with_block_ms(mut self, ms: u64) -> Self {
    self.broker.block_ms = ms;
    self
  }

  /// Sets the back-off after worker read errors in milliseconds.
  #[must_use]
  pub fn with_error_backoff_ms(mut self, ms: u64) -> Self {
    self.broker.error_backoff_ms = ms;
    self
  }

  /// Sets the node topology.
  #[must_use]
  pub fn with_topology(mut self, topology: TopologyConfig) -> Self {
    self.topology = topology;
    self
  }

  /// Sets the retry policy.
  #[must_use]
  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  /// Sets the enrichment depth bias.
  #[must_use]
  pub fn with_depth_bias(mut self, bias: f64) -> Self {
    self.enrichment.depth_bias = bias;
    self
  }

  /// Sets the default batch reverb size.
  #[must_use]
  pub fn with_batch_reverb_size(mut self, size: f64) -> Self {
    self.batch_reverb_size = size;
    self
  }
}

/// Host identity used as the default consumer name.
///
/// Checks `HOSTNAME`, then `COMPUTERNAME`, then `/etc/hostname`.
pub fn host_identity() -> String {
  ["HOSTNAME", "COMPUTERNAME"]
    .iter()
    .filter_map(|var| std::env::var(var).ok())
    .chain(std::fs::read_to_string("/etc/hostname").ok())
    .map(|name| name.trim().to_string())
    .find(|name| !name.is_empty())
    .unwrap_or_else(|| "localhost".to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  #[test]
  fn test_defaults() {
    let config = DistributionConfig::default();
    assert_eq!(config.broker.connection_url, "redis://localhost:6379");
    assert_eq!(config.broker.block_ms, 5000);
    assert_eq!(config.broker.error_backoff_ms, 1000);
    assert_eq!(config.retry.retries, 4);
    assert_eq!(config.retry.decay, 1.155);
    assert_eq!(config.retry.max_jitter_ms, 200);
    assert_eq!(config.enrichment.depth_bias, 1.05);
    assert_eq!(config.batch_reverb_size, 1.2);
    assert!(config.topology.stable_pool.is_empty());
  }

  #[test]
  fn test_partial_json_keeps_defaults() {
    let config = DistributionConfig::from_json_str(
      r#"{
        "broker": { "stream": "orders" },
        "topology": {
          "stable_pool": ["a", "b"],
          "elastic_pool": ["c", "d", "e"],
          "categories": { "ARENA": ["d", "e"] }
        },
        "retry": { "retries": 2 }
      }"#,
    )
    .unwrap();

    assert_eq!(config.broker.stream, "orders");
    assert_eq!(config.broker.group, "taskweave-workers");
    assert_eq!(config.topology.stable_pool, vec!["a", "b"]);
    assert_eq!(config.topology.categories["ARENA"], vec!["d", "e"]);
    assert_eq!(config.retry.retries, 2);
    assert_eq!(config.retry.decay, 1.155);
  }

  #[test]
  fn test_from_json_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "batch_reverb_size": 2.5, "broker": {{ "block_ms": 250 }} }}"#).unwrap();

    let config = DistributionConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.batch_reverb_size, 2.5);
    assert_eq!(config.broker.block_timeout(), Duration::from_millis(250));
  }

  #[test]
  fn test_invalid_json_is_a_config_error() {
    let err = DistributionConfig::from_json_str("{ not json").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));

    let err = DistributionConfig::from_json_file("/nonexistent/taskweave.json").unwrap_err();
    assert!(matches!(err, ConfigError::Io(_)));
  }

  #[test]
  fn test_retry_policy_base_delay_grows_by_decay() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.base_delay(0), Duration::from_secs(1));
    let second = policy.base_delay(1).as_secs_f64();
    assert!((second - 1.155).abs() < 1e-9);
    assert!(policy.base_delay(3) > policy.base_delay(2));
    assert_eq!(RetryPolicy::default().with_retries(0).attempts(), 1);
  }

  #[test]
  fn test_zero_block_timeout_is_raised_to_minimum() {
    let broker = BrokerConfig {
      block_ms: 0,
      ..Default::default()
    };
    assert_eq!(broker.block_timeout(), Duration::from_millis(MIN_BLOCK_MS));

    let config = DistributionConfig::from_json_str(r#"{ "broker": { "block_ms": 0 } }"#).unwrap();
    assert!(config.broker.block_timeout() > Duration::ZERO);
  }

  #[test]
  fn test_consumer_name_override_wins() {
    let broker = BrokerConfig {
      consumer_name: Some("worker-7".to_string()),
      ..Default::default()
    };
    assert_eq!(broker.resolved_consumer_name(), "worker-7");
    assert_eq!(broker.resolved_producer_id(), "worker-7");
    assert!(!host_identity().is_empty());
  }
}
