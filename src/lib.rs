//! # TaskWeave
//!
//! Signal enrichment, routing and consumer-group task distribution over an
//! append-only log broker.
//!
//! Producers hand a [`Signal`](signal::Signal) to a
//! [`DistributionManager`](distribution::DistributionManager). The signal is
//! enriched with structural metadata, routed to a node id, and appended to a
//! stream with bounded retries. Workers read the stream through a consumer
//! group and acknowledge each entry once their handler succeeds.
//!
//! ## Key Features
//!
//! - **Two routing strategies**: ordering-sensitive signals are pinned to a
//!   stable pool by SHA-256 of their affinity key; everything else is spread
//!   over an elastic pool
//! - **Category lanes**: named subsets of the elastic pool, hashed with xxh3
//! - **At-least-once delivery**: unacknowledged entries stay pending and can be
//!   reclaimed
//! - **Pluggable brokers**: Redis Streams (feature `redis`) or in-memory
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use taskweave::broker::InMemoryBroker;
//! use taskweave::config::{DistributionConfig, TopologyConfig};
//! use taskweave::distribution::DistributionManager;
//! use taskweave::error::HandlerError;
//! use taskweave::signal::{Payload, Signal};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), taskweave::error::DistributionError> {
//! let config = DistributionConfig::default().with_topology(
//!   TopologyConfig::default()
//!     .with_stable_pool(["railway-0"])
//!     .with_elastic_pool(["freeway-0", "freeway-1"]),
//! );
//! let manager = Arc::new(DistributionManager::new(config, Arc::new(InMemoryBroker::new()))?);
//! manager.start().await?;
//! manager.emit_signal(Signal::new("ping", Payload::new())).await?;
//!
//! let worker = manager.clone();
//! tokio::spawn(async move {
//!   worker
//!     .run_worker(|task_type: String, _payload: Payload| async move {
//!       println!("handling {task_type}");
//!       Ok::<(), HandlerError>(())
//!     })
//!     .await
//! });
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Log broker abstraction and backends.
pub mod broker;
/// Configuration types and loaders.
pub mod config;
/// Caller-facing distribution manager.
pub mod distribution;
/// Error types.
pub mod error;
/// Hashing strategies used for routing.
pub mod partitioning;
/// Retry, enrichment and probing primitives.
pub mod processor;
/// Signal routing over the node topology.
pub mod router;
/// Signal and batch task types.
pub mod signal;
/// Consumer-group worker pool.
pub mod worker;

pub use distribution::DistributionManager;
pub use error::{BrokerError, ConfigError, DistributionError, HandlerError};
pub use signal::{ContextType, Payload, Signal};
pub use worker::TaskHandler;
