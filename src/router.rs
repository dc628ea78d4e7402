//! # Router
//!
//! Pure routing decisions over a static [`NodeTopology`]. The router owns no
//! I/O and no mutable state, so a single instance can be shared by any number
//! of concurrent callers.
//!
//! ## Strategies
//!
//! | Entry point | Pool | Hash | Guarantee |
//! |---|---|---|---|
//! | [`Router::route_signal`], ordering-sensitive context | stable | SHA-256 | same key, same node |
//! | [`Router::route_signal`], any other context | elastic | none (uniform random) | load spreading |
//! | [`Router::route_by_category`] | category lanes | xxh3-64 | same category + key, same lane |
//!
//! Topology problems (empty pools, lanes outside the elastic pool, ...) are
//! rejected by [`Router::new`]; routing itself cannot fail.

use crate::config::TopologyConfig;
use crate::error::ConfigError;
use crate::partitioning::{Partitioner, RandomPartitioner, Sha256Partitioner, Xxh3Partitioner};
use crate::signal::ContextType;
use std::collections::{BTreeMap, HashSet};
use tracing::trace;

/// Identifier of a worker node.
pub type NodeId = String;

/// Category name to lane subset, keyed by lower-cased category name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CategoryPartitionMap {
  lanes: BTreeMap<String, Vec<NodeId>>,
}

impl CategoryPartitionMap {
  /// Looks up the lanes of a category, ignoring case.
  pub fn get(&self, category: &str) -> Option<&[NodeId]> {
    self
      .lanes
      .get(&category.to_lowercase())
      .map(Vec::as_slice)
  }
}

/// Validated node topology.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTopology {
  stable_pool: Vec<NodeId>,
  elastic_pool: Vec<NodeId>,
  categories: CategoryPartitionMap,
}

impl NodeTopology {
  /// Validates a topology configuration.
  ///
  /// # Errors
  ///
  /// Returns a [`ConfigError`] when a pool is empty, a node id is repeated,
  /// the pools overlap, or a category has no lanes, lanes outside the elastic
  /// pool, or a name that collides with another category ignoring case.
  pub fn from_config(config: &TopologyConfig) -> Result<Self, ConfigError> {
    if config.stable_pool.is_empty() {
      return Err(ConfigError::EmptyStablePool);
    }
    if config.elastic_pool.is_empty() {
      return Err(ConfigError::EmptyElasticPool);
    }

    unique_nodes(&config.stable_pool)?;
    let elastic = unique_nodes(&config.elastic_pool)?;
    if let Some(node) = config.stable_pool.iter().find(|n| elastic.contains(n.as_str())) {
      return Err(ConfigError::OverlappingPools(node.clone()));
    }

    let mut lanes = BTreeMap::new();
    for (category, members) in &config.categories {
      if members.is_empty() {
        return Err(ConfigError::EmptyLanes(category.clone()));
      }
      if let Some(node) = members.iter().find(|n| !elastic.contains(n.as_str())) {
        return Err(ConfigError::ForeignLane {
          category: category.clone(),
          node: node.clone(),
        });
      }
      unique_nodes(members)?;
      if lanes
        .insert(category.to_lowercase(), members.clone())
        .is_some()
      {
        return Err(ConfigError::DuplicateCategory(category.clone()));
      }
    }

    Ok(Self {
      stable_pool: config.stable_pool.clone(),
      elastic_pool: config.elastic_pool.clone(),
      categories: CategoryPartitionMap { lanes },
    })
  }

  /// Ordering-sensitive pool.
  pub fn stable_pool(&self) -> &[NodeId] {
    &self.stable_pool
  }

  /// Throughput pool.
  pub fn elastic_pool(&self) -> &[NodeId] {
    &self.elastic_pool
  }

  /// Category lanes.
  pub fn categories(&self) -> &CategoryPartitionMap {
    &self.categories
  }
}

fn unique_nodes(nodes: &[NodeId]) -> Result<HashSet<&str>, ConfigError> {
  let mut seen = HashSet::with_capacity(nodes.len());
  for node in nodes {
    if !seen.insert(node.as_str()) {
      return Err(ConfigError::DuplicateNode(node.clone()));
    }
  }
  Ok(seen)
}

/// Maps signals to node identifiers.
pub struct Router {
  topology: NodeTopology,
  interlock: Sha256Partitioner,
  spread: RandomPartitioner,
  lanes: Xxh3Partitioner,
}

impl Router {
  /// Builds a router, validating the topology.
  ///
  /// # Errors
  ///
  /// See [`NodeTopology::from_config`].
  pub fn new(config: &TopologyConfig) -> Result<Self, ConfigError> {
    Ok(Self::with_topology(NodeTopology::from_config(config)?))
  }

  /// Builds a router over an already validated topology.
  pub fn with_topology(topology: NodeTopology) -> Self {
    Self {
      topology,
      interlock: Sha256Partitioner::new(),
      spread: RandomPartitioner::new(),
      lanes: Xxh3Partitioner::new(),
    }
  }

  /// Picks a node for a signal based on its context type.
  ///
  /// Ordering-sensitive contexts are pinned to a stable-pool node by affinity
  /// key; all others get a random elastic-pool node.
  pub fn route_signal(&self, context_type: &ContextType, affinity_key: &str) -> &str {
    let node = if context_type.is_ordering_sensitive() {
      self.temporal_interlock(affinity_key)
    } else {
      self.structural_partition()
    };
    trace!(context = %context_type, affinity_key, node, "Routed signal");
    node
  }

  /// Picks a lane of `category` for `affinity_key`.
  ///
  /// Unknown categories use the whole elastic pool.
  pub fn route_by_category(&self, category: &str, affinity_key: &str) -> &str {
    let lanes = self.lanes_for(category);
    let node = &lanes[self.lanes.partition(affinity_key, lanes.len())];
    trace!(category, affinity_key, node = %node, "Routed signal by category");
    node
  }

  /// Lane subset used for `category`.
  pub fn lanes_for(&self, category: &str) -> &[NodeId] {
    self
      .topology
      .categories
      .get(category)
      .unwrap_or(self.topology.elastic_pool.as_slice())
  }

  /// The validated topology.
  pub fn topology(&self) -> &NodeTopology {
    &self.topology
  }

  fn temporal_interlock(&self, affinity_key: &str) -> &str {
    let pool = &self.topology.stable_pool;
    &pool[self.interlock.partition(affinity_key, pool.len())]
  }

  fn structural_partition(&self) -> &str {
    let pool = &self.topology.elastic_pool;
    &pool[self.spread.partition("", pool.len())]
  }
}

impl std::fmt::Debug for Router {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Router")
      .field("topology", &self.topology)
      .finish()
  }
}
