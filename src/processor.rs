//! # Signal Processor
//!
//! Stateless primitives shared by the distribution pipeline:
//!
//! - [`SignalProcessor::echo`]: bounded retry with exponential back-off and jitter.
//! - [`SignalProcessor::reverb`]: payload enrichment with structural metadata.
//! - [`SignalProcessor::glimpse`]: single-shot probe that never fails.
//! - [`SignalProcessor::delay`]: clock alignment for asynchronous producers.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskweave::config::{EnrichmentConfig, RetryPolicy};
//! use taskweave::processor::SignalProcessor;
//!
//! # async fn example() -> Result<(), taskweave::error::DistributionError> {
//! let processor = SignalProcessor::new(RetryPolicy::default(), EnrichmentConfig::default());
//! let id: u64 = processor
//!   .echo("ingest:user-42", || async { Ok::<_, std::io::Error>(7) })
//!   .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{EnrichmentConfig, RetryPolicy};
use crate::error::DistributionError;
use crate::signal::Payload;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, warn};

/// Structural metadata attached to an enriched payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resonance {
  /// Copy of the structure context.
  #[serde(flatten)]
  pub metadata: Payload,
  /// Enrichment scale factor.
  pub reverb_scale: f64,
  /// Optional external metadata.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub aura: Option<Payload>,
}

/// Signal payload merged with structural metadata.
///
/// Serializes as the original payload fields plus `resonance`,
/// `structural_timestamp` and `reverb_depth`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedPayload {
  /// Original signal payload.
  #[serde(flatten)]
  pub data: Payload,
  /// Structural metadata.
  pub resonance: Resonance,
  /// Nanoseconds since the Unix epoch, strictly increasing within the process.
  pub structural_timestamp: u64,
  /// `reverb_scale` multiplied by the configured depth bias.
  pub reverb_depth: f64,
}

impl EnrichedPayload {
  /// Flattens the enriched payload into a broker payload, adding the routing
  /// `target` and `category` fields.
  pub fn into_submission(
    self,
    target: &str,
    category: Option<&str>,
  ) -> Result<Payload, serde_json::Error> {
    let mut payload = match serde_json::to_value(self)? {
      serde_json::Value::Object(map) => map,
      // A struct with named fields always serializes as an object.
      other => {
        let mut map = Payload::new();
        map.insert("value".to_string(), other);
        map
      }
    };
    payload.insert("target".to_string(), target.into());
    payload.insert(
      "category".to_string(),
      category.map_or(serde_json::Value::Null, Into::into),
    );
    Ok(payload)
  }
}

/// Retry, enrichment and probing primitives.
#[derive(Debug, Clone, Default)]
pub struct SignalProcessor {
  retry: RetryPolicy,
  enrichment: EnrichmentConfig,
}

impl SignalProcessor {
  /// Creates a processor with the given retry policy and enrichment tunables.
  pub fn new(retry: RetryPolicy, enrichment: EnrichmentConfig) -> Self {
    Self { retry, enrichment }
  }

  /// Default retry policy used by [`echo`](Self::echo).
  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.retry
  }

  /// Runs `action` until it succeeds or the retry budget is spent.
  ///
  /// # Errors
  ///
  /// Returns [`DistributionError::SignalLost`] carrying `signal_id`, the number
  /// of attempts, and the last failure.
  pub async fn echo<T, E, F, Fut>(&self, signal_id: &str, action: F) -> Result<T, DistributionError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
  {
    self.echo_with(&self.retry, signal_id, action).await
  }

  /// Like [`echo`](Self::echo) with an explicit policy.
  pub async fn echo_with<T, E, F, Fut>(
    &self,
    policy: &RetryPolicy,
    signal_id: &str,
    mut action: F,
  ) -> Result<T, DistributionError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
  {
    let attempts = policy.attempts();
    let mut attempt = 0;
    loop {
      match action().await {
        Ok(value) => return Ok(value),
        Err(e) => {
          attempt += 1;
          if attempt >= attempts {
            error!(
              signal_id,
              attempts = attempt,
              error = %e,
              "Signal lost after exhausting retries"
            );
            return Err(DistributionError::SignalLost {
              signal_id: signal_id.to_string(),
              attempts: attempt,
              last_error: e.to_string(),
            });
          }
          let pause = backoff(policy, attempt - 1);
          warn!(
            signal_id,
            attempt,
            max_attempts = attempts,
            delay_ms = pause.as_millis() as u64,
            error = %e,
            "Attempt failed, retrying"
          );
          tokio::time::sleep(pause).await;
        }
      }
    }
  }

  /// Merges `signal_data` with structural metadata.
  ///
  /// `structure_context` is copied into the resonance map, `size` becomes
  /// `reverb_scale`, and `eq_aura`, when present, is attached as
  /// `resonance.aura`.
  pub fn reverb(
    &self,
    structure_context: &Payload,
    signal_data: Payload,
    size: f64,
    eq_aura: Option<Payload>,
  ) -> EnrichedPayload {
    EnrichedPayload {
      data: signal_data,
      resonance: Resonance {
        metadata: structure_context.clone(),
        reverb_scale: size,
        aura: eq_aura,
      },
      structural_timestamp: now_ns(),
      reverb_depth: size * self.enrichment.depth_bias,
    }
  }

  /// Runs `check` exactly once. Any failure reads as `false`.
  pub async fn glimpse<F, Fut, E>(&self, signal_id: &str, check: F) -> bool
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<bool, E>>,
    E: Display,
  {
    match check().await {
      Ok(state) => state,
      Err(e) => {
        debug!(signal_id, error = %e, "Probe failed");
        false
      }
    }
  }

  /// Sleeps for `offset_ms` milliseconds when positive.
  pub async fn delay(&self, signal_id: &str, offset_ms: i64) {
    if offset_ms > 0 {
      debug!(signal_id, offset_ms, "Delaying signal");
      tokio::time::sleep(Duration::from_millis(offset_ms as u64)).await;
    }
  }
}

fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
  let max_jitter = policy.max_jitter_ms;
  let jitter = if max_jitter == 0 {
    0
  } else {
    rand::thread_rng().gen_range(0..=max_jitter)
  };
  policy.base_delay(attempt) + Duration::from_millis(jitter)
}

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// Nanoseconds since the Unix epoch, strictly increasing across calls.
pub fn now_ns() -> u64 {
  let wall = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_nanos() as u64)
    .unwrap_or_default();
  let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
  loop {
    let next = wall.max(last + 1);
    match LAST_TIMESTAMP.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
      Ok(_) => return next,
      Err(actual) => last = actual,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::sync::Arc;
  use std::sync::atomic::AtomicU32;

  fn fast_policy(retries: u32) -> RetryPolicy {
    RetryPolicy::default()
      .with_retries(retries)
      .with_delay_unit(Duration::from_millis(1))
      .with_max_jitter(Duration::ZERO)
  }

  fn processor(retries: u32) -> SignalProcessor {
    SignalProcessor::new(fast_policy(retries), EnrichmentConfig::default())
  }

  fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
  }

  #[tokio::test]
  async fn test_echo_always_failing_runs_exactly_retries_times() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();

    let result: Result<(), _> = processor(4)
      .echo("ingest:user-42", || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<(), _>("broker unavailable") }
      })
      .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    match result {
      Err(DistributionError::SignalLost {
        signal_id,
        attempts,
        last_error,
      }) => {
        assert_eq!(signal_id, "ingest:user-42");
        assert_eq!(attempts, 4);
        assert_eq!(last_error, "broker unavailable");
      }
      other => panic!("expected SignalLost, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_echo_succeeding_on_kth_attempt_stops_there() {
    for k in 1..=4u32 {
      let calls = Arc::new(AtomicU32::new(0));
      let counter = calls.clone();

      let value = processor(4)
        .echo("sig", || {
          let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
          async move {
            if n < k {
              Err(format!("attempt {n} failed"))
            } else {
              Ok(n)
            }
          }
        })
        .await
        .unwrap();

      assert_eq!(value, k);
      assert_eq!(calls.load(Ordering::SeqCst), k);
    }
  }

  #[tokio::test]
  async fn test_echo_zero_retries_still_attempts_once() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let result = processor(0)
      .echo("sig", || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<u8, _>("nope") }
      })
      .await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_echo_sleeps_between_attempts() {
    let policy = RetryPolicy::default()
      .with_retries(3)
      .with_decay(2.0)
      .with_delay_unit(Duration::from_millis(10))
      .with_max_jitter(Duration::ZERO);
    let processor = SignalProcessor::new(policy, EnrichmentConfig::default());

    let started = std::time::Instant::now();
    let _ = processor
      .echo("sig", || async { Err::<(), _>("down") })
      .await;
    // 10ms * 2^0 + 10ms * 2^1, no sleep after the last attempt.
    assert!(started.elapsed() >= Duration::from_millis(30));
  }

  #[test]
  fn test_backoff_jitter_is_bounded() {
    let policy = RetryPolicy::default()
      .with_delay_unit(Duration::from_millis(100))
      .with_max_jitter(Duration::from_millis(200));
    for attempt in 0..4 {
      let base = policy.base_delay(attempt);
      let pause = backoff(&policy, attempt);
      assert!(pause >= base);
      assert!(pause <= base + Duration::from_millis(200));
    }
  }

  #[test]
  fn test_reverb_merges_context_and_scales_depth() {
    let processor = processor(1);
    let context = payload(json!({"context_type": "SEED", "affinity_key": "user-42"}));
    let enriched = processor.reverb(
      &context,
      payload(json!({"order": 17})),
      2.0,
      Some(payload(json!({"region": "eu"}))),
    );

    assert_eq!(enriched.data["order"], 17);
    assert_eq!(enriched.resonance.metadata, context);
    assert_eq!(enriched.resonance.reverb_scale, 2.0);
    assert_eq!(enriched.resonance.aura.as_ref().unwrap()["region"], "eu");
    assert!((enriched.reverb_depth - 2.1).abs() < 1e-12);
    assert!(enriched.structural_timestamp > 0);
  }

  #[test]
  fn test_reverb_depth_bias_is_configurable() {
    let processor = SignalProcessor::new(
      RetryPolicy::default(),
      EnrichmentConfig { depth_bias: 2.0 },
    );
    let enriched = processor.reverb(&Payload::new(), Payload::new(), 1.5, None);
    assert_eq!(enriched.reverb_depth, 3.0);
    assert!(enriched.resonance.aura.is_none());
  }

  #[test]
  fn test_enriched_payload_submission_shape() {
    let enriched = processor(1).reverb(
      &payload(json!({"task_type": "ingest"})),
      payload(json!({"order": 17})),
      1.0,
      None,
    );
    let timestamp = enriched.structural_timestamp;
    let submitted = enriched.into_submission("freeway-1", Some("ARENA")).unwrap();

    assert_eq!(submitted["order"], 17);
    assert_eq!(submitted["target"], "freeway-1");
    assert_eq!(submitted["category"], "ARENA");
    assert_eq!(submitted["structural_timestamp"], timestamp);
    assert_eq!(submitted["reverb_depth"], 1.05);
    assert_eq!(submitted["resonance"]["task_type"], "ingest");
    assert_eq!(submitted["resonance"]["reverb_scale"], 1.0);
    assert!(submitted["resonance"].get("aura").is_none());

    let uncategorized = processor(1)
      .reverb(&Payload::new(), Payload::new(), 1.0, None)
      .into_submission("railway-0", None)
      .unwrap();
    assert!(uncategorized["category"].is_null());
  }

  #[test]
  fn test_enriched_payload_round_trips_through_json() {
    let enriched = processor(1).reverb(
      &payload(json!({"k": "v"})),
      payload(json!({"order": 1})),
      1.0,
      Some(payload(json!({"a": 1}))),
    );
    let json = serde_json::to_string(&enriched).unwrap();
    let back: EnrichedPayload = serde_json::from_str(&json).unwrap();
    assert_eq!(back, enriched);
  }

  #[test]
  fn test_timestamps_strictly_increase() {
    let mut previous = now_ns();
    for _ in 0..1000 {
      let next = now_ns();
      assert!(next > previous);
      previous = next;
    }
  }

  #[tokio::test]
  async fn test_glimpse_never_retries_and_maps_errors_to_false() {
    let processor = processor(4);
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let state = processor
      .glimpse("sig", || async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Err::<bool, _>("unreachable")
      })
      .await;
    assert!(!state);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(processor.glimpse("sig", || async { Ok::<_, String>(true) }).await);
    assert!(!processor.glimpse("sig", || async { Ok::<_, String>(false) }).await);
  }

  #[tokio::test]
  async fn test_delay_waits_only_for_positive_offsets() {
    let processor = processor(1);

    let started = std::time::Instant::now();
    processor.delay("sig", -50).await;
    processor.delay("sig", 0).await;
    assert!(started.elapsed() < Duration::from_millis(20));

    let started = std::time::Instant::now();
    processor.delay("sig", 25).await;
    assert!(started.elapsed() >= Duration::from_millis(25));
  }
}
