//! Caller-facing distribution layer.
//!
//! A [`DistributionManager`] ties the [`SignalProcessor`], the [`Router`] and a
//! [`WorkerPool`] together: signals are enriched, routed to a node id, and
//! submitted to the broker with bounded retries.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use taskweave::broker::InMemoryBroker;
//! use taskweave::config::{DistributionConfig, TopologyConfig};
//! use taskweave::distribution::DistributionManager;
//! use taskweave::signal::{ContextType, Payload, Signal};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), taskweave::error::DistributionError> {
//! let config = DistributionConfig::default().with_topology(
//!   TopologyConfig::default()
//!     .with_stable_pool(["railway-0", "railway-1"])
//!     .with_elastic_pool(["freeway-0", "freeway-1"]),
//! );
//! let manager = Arc::new(DistributionManager::new(config, Arc::new(InMemoryBroker::new()))?);
//! manager.start().await?;
//!
//! let entry_id = manager
//!   .emit_signal(
//!     Signal::new("settle_account", Payload::new())
//!       .with_context(ContextType::CoreState)
//!       .with_affinity_key("account-9"),
//!   )
//!   .await?;
//! # let _ = entry_id;
//! # Ok(())
//! # }
//! ```

use crate::broker::{Broker, EntryId};
use crate::config::DistributionConfig;
use crate::error::DistributionError;
use crate::processor::SignalProcessor;
use crate::router::Router;
use crate::signal::{BatchTask, ContextType, Payload, Signal};
use crate::worker::{TaskHandler, WorkerPool};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entry point for producers and workers.
///
/// All methods take `&self`; share one manager through an [`Arc`] between
/// producer tasks and a worker loop.
#[derive(Debug)]
pub struct DistributionManager {
  processor: SignalProcessor,
  router: Router,
  worker_pool: WorkerPool,
  batch_reverb_size: f64,
}

impl DistributionManager {
  /// Builds a manager over `broker`.
  ///
  /// # Errors
  ///
  /// Returns [`DistributionError::Config`] when the topology is invalid.
  pub fn new(config: DistributionConfig, broker: Arc<dyn Broker>) -> Result<Self, DistributionError> {
    let router = Router::new(&config.topology)?;
    let processor = SignalProcessor::new(config.retry, config.enrichment);
    let worker_pool = WorkerPool::new(broker, config.broker);
    Ok(Self {
      processor,
      router,
      worker_pool,
      batch_reverb_size: config.batch_reverb_size,
    })
  }

  /// Builds a manager over a [`RedisBroker`](crate::broker::RedisBroker) for
  /// the configured connection URL.
  ///
  /// # Errors
  ///
  /// Fails on an invalid topology or an unparsable URL. No connection is made.
  #[cfg(feature = "redis")]
  pub fn from_config(config: DistributionConfig) -> Result<Self, DistributionError> {
    let broker = crate::broker::RedisBroker::new(config.broker.connection_url.clone())?;
    Self::new(config, Arc::new(broker))
  }

  /// Connects the worker pool and ensures the consumer group exists.
  pub async fn start(&self) -> Result<(), DistributionError> {
    self.worker_pool.connect().await
  }

  /// Stops the worker loop and closes the broker connection.
  pub async fn stop(&self) -> Result<(), DistributionError> {
    self.worker_pool.stop().await
  }

  /// Runs the worker loop on the current task until [`stop`](Self::stop).
  pub async fn run_worker<H: TaskHandler>(&self, handler: H) {
    self.worker_pool.start_worker(handler).await
  }

  /// Enriches, routes and submits one signal.
  ///
  /// Category signals use the category's lanes; the rest are routed by
  /// context type. The submission is retried per the configured policy.
  ///
  /// # Errors
  ///
  /// [`DistributionError::SignalLost`] once every attempt has failed.
  pub async fn emit_signal(&self, signal: Signal) -> Result<EntryId, DistributionError> {
    let signal_id = signal.id();
    let target = match signal.category() {
      Some(category) => self.router.route_by_category(category, signal.affinity_key()),
      None => self
        .router
        .route_signal(signal.context_type(), signal.affinity_key()),
    }
    .to_string();
    let structure_context = structure_context(&signal);
    let category = signal.category().map(str::to_string);
    let reverb_size = signal.reverb_size();
    let (task_type, payload) = signal.into_parts();

    let submission = self
      .processor
      .reverb(&structure_context, payload, reverb_size, None)
      .into_submission(&target, category.as_deref())?;

    debug!(signal_id = %signal_id, target = %target, category = ?category, "Emitting signal");
    self
      .processor
      .echo(&signal_id, || {
        self.worker_pool.submit_task(&task_type, submission.clone())
      })
      .await
  }

  /// Emits `tasks` in order through the lanes of `category`.
  ///
  /// Task `i` gets the affinity key `"{category}_{i}"` and an `Agile` context.
  ///
  /// # Errors
  ///
  /// On the first failure returns [`DistributionError::BatchInterrupted`]
  /// with the ids already submitted. Those entries stay in the stream.
  pub async fn emit_batch(
    &self,
    category: &str,
    tasks: Vec<BatchTask>,
    reverb_size: f64,
  ) -> Result<Vec<EntryId>, DistributionError> {
    let total = tasks.len();
    let mut submitted = Vec::with_capacity(total);

    for (index, task) in tasks.into_iter().enumerate() {
      let signal = Signal::new(task.task_type, task.payload)
        .with_context(ContextType::Agile)
        .with_affinity_key(format!("{category}_{index}"))
        .with_category(category)
        .with_reverb_size(reverb_size);

      match self.emit_signal(signal).await {
        Ok(entry_id) => submitted.push(entry_id),
        Err(e) => {
          warn!(
            category,
            failed_index = index,
            submitted = submitted.len(),
            total,
            error = %e,
            "Batch interrupted"
          );
          return Err(DistributionError::BatchInterrupted {
            submitted,
            failed_index: index,
            source: Box::new(e),
          });
        }
      }
    }

    info!(category, count = total, "Batch emitted");
    Ok(submitted)
  }

  /// [`emit_batch`](Self::emit_batch) with the configured batch reverb size.
  pub async fn emit_batch_default(
    &self,
    category: &str,
    tasks: Vec<BatchTask>,
  ) -> Result<Vec<EntryId>, DistributionError> {
    self.emit_batch(category, tasks, self.batch_reverb_size).await
  }

  /// Signal processor.
  pub fn processor(&self) -> &SignalProcessor {
    &self.processor
  }

  /// Router.
  pub fn router(&self) -> &Router {
    &self.router
  }

  /// Worker pool.
  pub fn worker_pool(&self) -> &WorkerPool {
    &self.worker_pool
  }
}

fn structure_context(signal: &Signal) -> Payload {
  let mut context = Payload::new();
  context.insert("task_type".to_string(), Value::from(signal.task_type()));
  context.insert(
    "context_type".to_string(),
    Value::from(signal.context_type().as_str()),
  );
  context.insert("affinity_key".to_string(), Value::from(signal.affinity_key()));
  context
}
