//! # Signals
//!
//! A [`Signal`] is a task submission on its way to the broker. It carries the
//! task type, a schema-less payload and the routing hints the
//! [`Router`](crate::router::Router) needs: the [`ContextType`], the affinity
//! key, and an optional category.
//!
//! ```rust
//! use taskweave::signal::{ContextType, Signal};
//! use serde_json::json;
//!
//! let signal = Signal::new("rebuild_index", json!({"shard": 3}).as_object().cloned().unwrap())
//!   .with_context(ContextType::CoreState)
//!   .with_affinity_key("tenant-7")
//!   .with_reverb_size(1.5);
//! assert!(signal.context_type().is_ordering_sensitive());
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Schema-less key-value payload. Handlers deserialize it into their own types.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Classification of a signal that decides its routing strategy.
///
/// `Seed` and `CoreState` are ordering-sensitive and are pinned to the stable
/// pool by affinity key. Every other class is spread over the elastic pool.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ContextType {
  /// Bootstrap signals that establish causal state.
  Seed,
  /// Mutations of core state; must stay ordered per affinity key.
  CoreState,
  /// Throughput-oriented work without ordering requirements.
  #[default]
  Agile,
  /// Background work without ordering requirements.
  Ambient,
  /// Any other label, stored upper-cased.
  Custom(String),
}

impl ContextType {
  /// Returns `true` when signals of this class must be routed deterministically.
  ///
  /// A hand-built `Custom` carrying a known label is judged by that label.
  pub fn is_ordering_sensitive(&self) -> bool {
    match self {
      ContextType::Seed | ContextType::CoreState => true,
      ContextType::Custom(label) => matches!(
        ContextType::from(label.as_str()),
        ContextType::Seed | ContextType::CoreState
      ),
      _ => false,
    }
  }

  /// Returns the wire label of this context type.
  pub fn as_str(&self) -> &str {
    match self {
      ContextType::Seed => "SEED",
      ContextType::CoreState => "CORE_STATE",
      ContextType::Agile => "AGILE",
      ContextType::Ambient => "AMBIENT",
      ContextType::Custom(label) => label,
    }
  }
}

impl fmt::Display for ContextType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for ContextType {
  type Err = std::convert::Infallible;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let label = s.trim().to_ascii_uppercase().replace('-', "_");
    Ok(match label.as_str() {
      "SEED" => ContextType::Seed,
      "CORE_STATE" => ContextType::CoreState,
      "AGILE" => ContextType::Agile,
      "AMBIENT" => ContextType::Ambient,
      _ => ContextType::Custom(label),
    })
  }
}

impl From<&str> for ContextType {
  fn from(s: &str) -> Self {
    match s.parse() {
      Ok(context) => context,
      Err(never) => match never {},
    }
  }
}

impl Serialize for ContextType {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(self.as_str())
  }
}

impl<'de> Deserialize<'de> for ContextType {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let label = String::deserialize(deserializer)?;
    Ok(ContextType::from(label.as_str()))
  }
}

/// A task submission request.
///
/// Built once by the caller and consumed by
/// [`DistributionManager::emit_signal`](crate::distribution::DistributionManager::emit_signal).
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
  task_type: String,
  payload: Payload,
  context_type: ContextType,
  affinity_key: String,
  category: Option<String>,
  reverb_size: f64,
}

impl Signal {
  /// Creates a signal with an `Agile` context, empty affinity key, no category
  /// and a reverb size of `1.0`.
  pub fn new(task_type: impl Into<String>, payload: Payload) -> Self {
    Self {
      task_type: task_type.into(),
      payload,
      context_type: ContextType::default(),
      affinity_key: String::new(),
      category: None,
      reverb_size: 1.0,
    }
  }

  /// Sets the context type.
  #[must_use]
  pub fn with_context(mut self, context_type: impl Into<ContextType>) -> Self {
    self.context_type = context_type.into();
    self
  }

  /// Sets the affinity key used for routing hashes.
  #[must_use]
  pub fn with_affinity_key(mut self, key: impl Into<String>) -> Self {
    self.affinity_key = key.into();
    self
  }

  /// Routes the signal through a named category lane.
  #[must_use]
  pub fn with_category(mut self, category: impl Into<String>) -> Self {
    self.category = Some(category.into());
    self
  }

  /// Sets the enrichment scale factor.
  #[must_use]
  pub fn with_reverb_size(mut self, size: f64) -> Self {
    self.reverb_size = size;
    self
  }

  /// Task type name.
  pub fn task_type(&self) -> &str {
    &self.task_type
  }

  /// Payload fields.
  pub fn payload(&self) -> &Payload {
    &self.payload
  }

  /// Context type.
  pub fn context_type(&self) -> &ContextType {
    &self.context_type
  }

  /// Affinity key.
  pub fn affinity_key(&self) -> &str {
    &self.affinity_key
  }

  /// Category, if any.
  pub fn category(&self) -> Option<&str> {
    self.category.as_deref()
  }

  /// Enrichment scale factor.
  pub fn reverb_size(&self) -> f64 {
    self.reverb_size
  }

  /// Correlation id used in retry errors and logs.
  pub fn id(&self) -> String {
    format!("{}:{}", self.task_type, self.affinity_key)
  }

  /// Splits the signal into its task type and payload.
  pub fn into_parts(self) -> (String, Payload) {
    (self.task_type, self.payload)
  }
}

/// One task of a batch submitted through
/// [`DistributionManager::emit_batch`](crate::distribution::DistributionManager::emit_batch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchTask {
  /// Task type name.
  pub task_type: String,
  /// Payload fields.
  pub payload: Payload,
}

impl BatchTask {
  /// Creates a batch task.
  pub fn new(task_type: impl Into<String>, payload: Payload) -> Self {
    Self {
      task_type: task_type.into(),
      payload,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_context_type_parsing_is_case_insensitive() {
    assert_eq!(ContextType::from("seed"), ContextType::Seed);
    assert_eq!(ContextType::from("Core_State"), ContextType::CoreState);
    assert_eq!(ContextType::from("core-state"), ContextType::CoreState);
    assert_eq!(ContextType::from("agile"), ContextType::Agile);
    assert_eq!(
      ContextType::from("harvest"),
      ContextType::Custom("HARVEST".to_string())
    );
  }

  #[test]
  fn test_only_seed_and_core_state_are_ordering_sensitive() {
    assert!(ContextType::Seed.is_ordering_sensitive());
    assert!(ContextType::CoreState.is_ordering_sensitive());
    assert!(!ContextType::Agile.is_ordering_sensitive());
    assert!(!ContextType::Ambient.is_ordering_sensitive());
    assert!(!ContextType::from("harvest").is_ordering_sensitive());
  }

  #[test]
  fn test_custom_with_known_label_keeps_its_ordering() {
    assert!(ContextType::Custom("SEED".into()).is_ordering_sensitive());
    assert!(ContextType::Custom("core-state".into()).is_ordering_sensitive());
    assert!(!ContextType::Custom("AGILE".into()).is_ordering_sensitive());
    assert!(!ContextType::Custom("HARVEST".into()).is_ordering_sensitive());
  }

  #[test]
  fn test_context_type_serde_uses_wire_labels() {
    let json = serde_json::to_string(&ContextType::CoreState).unwrap();
    assert_eq!(json, "\"CORE_STATE\"");
    let back: ContextType = serde_json::from_str("\"seed\"").unwrap();
    assert_eq!(back, ContextType::Seed);
  }

  #[test]
  fn test_signal_builder_and_id() {
    let signal = Signal::new("ingest", Payload::new())
      .with_context("SEED")
      .with_affinity_key("user-42")
      .with_category("arena")
      .with_reverb_size(2.0);

    assert_eq!(signal.task_type(), "ingest");
    assert_eq!(signal.context_type(), &ContextType::Seed);
    assert_eq!(signal.affinity_key(), "user-42");
    assert_eq!(signal.category(), Some("arena"));
    assert_eq!(signal.reverb_size(), 2.0);
    assert_eq!(signal.id(), "ingest:user-42");
  }
}
