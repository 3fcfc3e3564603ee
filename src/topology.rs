//! Topology probing.
//!
//! The planner needs two facts from the store: how many keyspace partitions
//! exist, and (for direct-server planning) roughly how many items each node
//! holds. [`TopologyProbe`] is the seam to whatever client library answers
//! those questions.

use crate::config::DumpConfig;
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Item count reported by one storage node.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct NodeItemCount {
  /// Location of the node, as configured.
  pub location: String,
  /// Number of items the node reports holding.
  pub items: u64,
}

/// Queries the store for its partition layout.
#[async_trait]
pub trait TopologyProbe: Send + Sync {
  /// Total number of keyspace partitions in the configured bucket.
  ///
  /// # Errors
  ///
  /// [`DumpError::Connection`](crate::error::DumpError::Connection) if no node
  /// could be reached or the credential was rejected.
  async fn partition_count(&self, config: &DumpConfig) -> Result<usize>;

  /// Per-node item estimates, one entry per reachable node.
  async fn node_item_counts(&self, config: &DumpConfig) -> Result<Vec<NodeItemCount>>;
}

/// A probe that answers from fixed values, for planning without a live store.
#[derive(Clone, Debug, Default)]
pub struct StaticTopology {
  partitions: usize,
  items: HashMap<String, u64>,
}

impl StaticTopology {
  /// Creates a probe reporting `partitions` partitions and no node statistics.
  pub fn new(partitions: usize) -> Self {
    Self {
      partitions,
      items: HashMap::new(),
    }
  }

  /// Adds an item count for a node location.
  #[must_use]
  pub fn with_node(mut self, location: impl Into<String>, items: u64) -> Self {
    self.items.insert(location.into(), items);
    self
  }
}

#[async_trait]
impl TopologyProbe for StaticTopology {
  async fn partition_count(&self, _config: &DumpConfig) -> Result<usize> {
    Ok(self.partitions)
  }

  async fn node_item_counts(&self, config: &DumpConfig) -> Result<Vec<NodeItemCount>> {
    Ok(
      config
        .locations
        .iter()
        .filter_map(|location| {
          self.items.get(location).map(|items| NodeItemCount {
            location: location.clone(),
            items: *items,
          })
        })
        .collect(),
    )
  }
}
