//! # Partitioning Strategies
//!
//! Hashing seams used by the [`Router`](crate::router::Router) to map an
//! affinity key onto one member of a node pool.
//!
//! - **[`Sha256Partitioner`]**: cryptographic-strength hash; the same key always
//!   lands on the same partition, across processes and restarts.
//! - **[`Xxh3Partitioner`]**: fast non-cryptographic hash, also unseeded and
//!   therefore stable across restarts. Used for category lanes.
//! - **[`RandomPartitioner`]**: uniform choice per call, ignores the key.
//!
//! Hashers with per-process random state (`std::collections::hash_map::DefaultHasher`
//! with `RandomState`, `ahash`) must not be used here: they break the
//! "same key, same node" guarantee between deployments.

use rand::Rng;
use sha2::{Digest, Sha256};
use xxhash_rust::xxh3::xxh3_64;

/// Maps a key onto a partition index.
pub trait Partitioner: Send + Sync {
  /// Returns the partition index for `key`, in `0..num_partitions`.
  ///
  /// Returns `0` when `num_partitions` is zero.
  fn partition(&self, key: &str, num_partitions: usize) -> usize;
}

/// SHA-256 based partitioner.
///
/// The first eight digest bytes are read big-endian and reduced modulo the
/// partition count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Partitioner;

impl Sha256Partitioner {
  /// Creates a new SHA-256 partitioner.
  #[must_use]
  pub fn new() -> Self {
    Self
  }

  fn hash_key(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
  }
}

impl Partitioner for Sha256Partitioner {
  fn partition(&self, key: &str, num_partitions: usize) -> usize {
    if num_partitions == 0 {
      return 0;
    }
    (Self::hash_key(key) % num_partitions as u64) as usize
  }
}

/// xxh3-64 based partitioner.
#[derive(Debug, Clone, Copy, Default)]
pub struct Xxh3Partitioner;

impl Xxh3Partitioner {
  /// Creates a new xxh3 partitioner.
  #[must_use]
  pub fn new() -> Self {
    Self
  }
}

impl Partitioner for Xxh3Partitioner {
  fn partition(&self, key: &str, num_partitions: usize) -> usize {
    if num_partitions == 0 {
      return 0;
    }
    (xxh3_64(key.as_bytes()) % num_partitions as u64) as usize
  }
}

/// Uniform random partitioner.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomPartitioner;

impl RandomPartitioner {
  /// Creates a new random partitioner.
  #[must_use]
  pub fn new() -> Self {
    Self
  }
}

impl Partitioner for RandomPartitioner {
  fn partition(&self, _key: &str, num_partitions: usize) -> usize {
    if num_partitions == 0 {
      return 0;
    }
    rand::thread_rng().gen_range(0..num_partitions)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  #[test]
  fn test_sha256_partitioner_is_deterministic() {
    let partitioner = Sha256Partitioner::new();
    let p1 = partitioner.partition("user-42", 7);
    let p2 = partitioner.partition("user-42", 7);
    let p3 = partitioner.partition("user-42", 7);
    assert_eq!(p1, p2);
    assert_eq!(p2, p3);
    assert!(p1 < 7);
  }

  #[test]
  fn test_sha256_partitioner_matches_known_digest() {
    // sha256("abc") starts with ba7816bf8f01cfea
    assert_eq!(Sha256Partitioner::hash_key("abc"), 0xba78_16bf_8f01_cfea);
    let expected = (0xba78_16bf_8f01_cfea_u64 % 5) as usize;
    assert_eq!(Sha256Partitioner::new().partition("abc", 5), expected);
  }

  #[test]
  fn test_xxh3_partitioner_is_unseeded() {
    let partitioner = Xxh3Partitioner::new();
    let expected = (xxh3_64(b"ARENA_0") % 3) as usize;
    assert_eq!(partitioner.partition("ARENA_0", 3), expected);
  }

  #[test]
  fn test_hash_partitioners_spread_keys() {
    for (name, partitioner) in [
      ("sha256", &Sha256Partitioner::new() as &dyn Partitioner),
      ("xxh3", &Xxh3Partitioner::new()),
    ] {
      let used: HashSet<usize> = (0..200)
        .map(|i| partitioner.partition(&format!("key-{i}"), 4))
        .collect();
      assert_eq!(used.len(), 4, "{name} left partitions unused");
    }
  }

  #[test]
  fn test_random_partitioner_stays_in_range_and_varies() {
    let partitioner = RandomPartitioner::new();
    let seen: HashSet<usize> = (0..500).map(|_| partitioner.partition("k", 3)).collect();
    assert!(seen.iter().all(|p| *p < 3));
    assert!(seen.len() > 1);
  }

  #[test]
  fn test_zero_partitions() {
    assert_eq!(Sha256Partitioner::new().partition("k", 0), 0);
    assert_eq!(Xxh3Partitioner::new().partition("k", 0), 0);
    assert_eq!(RandomPartitioner::new().partition("k", 0), 0);
  }

  #[test]
  fn test_single_partition() {
    assert_eq!(Sha256Partitioner::new().partition("a", 1), 0);
    assert_eq!(Xxh3Partitioner::new().partition("b", 1), 0);
    assert_eq!(RandomPartitioner::new().partition("c", 1), 0);
  }
}
