//! Cache partitions and their eviction policies.

use chrono::Duration;
use serde::Deserialize;

/// A named namespace within the cache store.
///
/// Each partition has its own active generation and its own eviction
/// policy. An entry key is unique within a partition, never across them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// Application shell and other long-lived static assets.
  Static,
  /// Navigable documents and other frequently changing pages.
  Dynamic,
  /// Image assets.
  Images,
  /// API responses.
  Api,
}

impl Partition {
  pub const ALL: [Partition; 4] = [
    Partition::Static,
    Partition::Dynamic,
    Partition::Images,
    Partition::Api,
  ];

  /// Stable name used as the storage discriminator.
  pub fn as_str(&self) -> &'static str {
    match self {
      Partition::Static => "static",
      Partition::Dynamic => "dynamic",
      Partition::Images => "images",
      Partition::Api => "api",
    }
  }
}

/// Eviction policy for one partition.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PartitionPolicy {
  /// Maximum live entries before oldest-first eviction kicks in.
  pub max_entries: usize,
  /// Maximum entry age in seconds.
  pub max_age_seconds: i64,
}

impl PartitionPolicy {
  pub fn max_age(&self) -> Duration {
    Duration::seconds(self.max_age_seconds)
  }
}

/// Per-partition policy table, configurable per deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CachePolicies {
  pub static_assets: PartitionPolicy,
  pub dynamic: PartitionPolicy,
  pub images: PartitionPolicy,
  pub api: PartitionPolicy,
}

impl CachePolicies {
  pub fn for_partition(&self, partition: Partition) -> PartitionPolicy {
    match partition {
      Partition::Static => self.static_assets,
      Partition::Dynamic => self.dynamic,
      Partition::Images => self.images,
      Partition::Api => self.api,
    }
  }
}

impl Default for CachePolicies {
  fn default() -> Self {
    Self {
      static_assets: PartitionPolicy {
        max_entries: 200,
        max_age_seconds: 7 * 24 * 3600,
      },
      dynamic: PartitionPolicy {
        max_entries: 50,
        max_age_seconds: 24 * 3600,
      },
      images: PartitionPolicy {
        max_entries: 100,
        max_age_seconds: 30 * 24 * 3600,
      },
      api: PartitionPolicy {
        max_entries: 100,
        max_age_seconds: 3600,
      },
    }
  }
}
