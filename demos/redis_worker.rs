//! # Redis Worker Example
//!
//! Emits a few signals into a Redis stream and consumes them on the same
//! process until Ctrl-C.
//!
//! ```bash
//! REDIS_URL=redis://localhost:6379 RUST_LOG=taskweave=debug cargo run --example redis_worker
//! ```

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use taskweave::config::{DistributionConfig, TopologyConfig};
use taskweave::signal::BatchTask;
use taskweave::{ContextType, DistributionManager, HandlerError, Payload, Signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string());
  let config = DistributionConfig::default()
    .with_connection_url(url)
    .with_stream("taskweave:demo")
    .with_group("demo-workers")
    .with_topology(
      TopologyConfig::default()
        .with_stable_pool(["railway-0", "railway-1"])
        .with_elastic_pool(["freeway-0", "freeway-1", "freeway-2"])
        .with_category("arena", ["freeway-1", "freeway-2"]),
    );

  let manager = Arc::new(DistributionManager::from_config(config)?);
  manager.start().await?;

  let worker = {
    let manager = manager.clone();
    tokio::spawn(async move {
      manager
        .run_worker(|task_type: String, payload: Payload| async move {
          info!(
            task_type = %task_type,
            target = %payload.get("target").cloned().unwrap_or_default(),
            "Handled task"
          );
          Ok::<(), HandlerError>(())
        })
        .await
    })
  };

  let order = json!({"order_id": 1001, "total": 42.5});
  let entry_id = manager
    .emit_signal(
      Signal::new("settle_order", order.as_object().cloned().unwrap_or_default())
        .with_context(ContextType::CoreState)
        .with_affinity_key("customer-17"),
    )
    .await?;
  info!(entry_id = %entry_id, "Emitted ordered signal");

  let waves = (0..3)
    .map(|wave| {
      let payload = json!({"wave": wave});
      BatchTask::new("spawn_wave", payload.as_object().cloned().unwrap_or_default())
    })
    .collect();
  let ids = manager.emit_batch_default("arena", waves).await?;
  info!(count = ids.len(), "Emitted arena batch");

  tokio::select! {
    _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    _ = tokio::time::sleep(Duration::from_secs(30)) => info!("Demo finished"),
  }

  if let Err(e) = manager.stop().await {
    error!(error = %e, "Failed to stop worker pool");
  }
  worker.await?;
  Ok(())
}
