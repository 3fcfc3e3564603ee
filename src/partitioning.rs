//! # Split Planning
//!
//! Divides the store's fixed keyspace partitions into balanced, disjoint work
//! units. Given `N` partitions and a requested parallelism `P`:
//!
//! - `min(N, P)` splits are produced, none of them empty;
//! - the first `N % P` splits hold `N / P + 1` partitions, the rest `N / P`;
//! - partitions are handed out in increasing ID order, split by split, so the
//!   union of all splits is exactly `0..N` with no overlaps.
//!
//! Planning is deterministic: the same `(N, P)` always yields the same
//! descriptors, so a retried job re-plans to the identical assignment.
//!
//! ## Usage
//!
//! ```rust
//! use kvweave::partitioning::SplitPlanner;
//!
//! let splits = SplitPlanner::plan(10, 3).unwrap();
//! let sizes: Vec<usize> = splits.iter().map(|s| s.len()).collect();
//! assert_eq!(sizes, vec![4, 3, 3]);
//! assert_eq!(splits[1].partitions(), &[4, 5, 6]);
//! ```

use crate::config::{ConnectionStrategy, DumpConfig};
use crate::error::{DumpError, Result};
use crate::split::{InputSplit, PartitionId, SplitDescriptor};
use crate::topology::TopologyProbe;
use tracing::debug;

/// Largest partition count that can be planned; IDs and counts travel as `u16`.
pub const MAX_PARTITIONS: usize = u16::MAX as usize;

/// Computes split assignments.
#[derive(Clone, Copy, Debug, Default)]
pub struct SplitPlanner;

impl SplitPlanner {
  /// Splits partitions `0..partitions` into at most `parallelism` balanced,
  /// non-empty, disjoint descriptors.
  ///
  /// # Errors
  ///
  /// [`DumpError::Configuration`] if `parallelism` is zero or `partitions`
  /// exceeds [`MAX_PARTITIONS`].
  pub fn plan(partitions: usize, parallelism: u32) -> Result<Vec<SplitDescriptor>> {
    if parallelism < 1 {
      return Err(DumpError::Configuration(format!(
        "parallelism must be >= 1, got {}",
        parallelism
      )));
    }
    if partitions > MAX_PARTITIONS {
      return Err(DumpError::Configuration(format!(
        "store reports {} partitions, at most {} are supported",
        partitions, MAX_PARTITIONS
      )));
    }

    let split_count = partitions.min(parallelism as usize);
    let mut splits = Vec::with_capacity(split_count);
    if split_count == 0 {
      return Ok(splits);
    }

    let base = partitions / split_count;
    let remainder = partitions % split_count;
    let mut next: usize = 0;
    for index in 0..split_count {
      let size = if index < remainder { base + 1 } else { base };
      let end = next + size;
      // end <= partitions <= MAX_PARTITIONS, so both bounds fit a PartitionId.
      splits.push(SplitDescriptor::from_range(
        next as PartitionId..end as PartitionId,
      ));
      next = end;
    }
    debug_assert_eq!(next, partitions);
    Ok(splits)
  }

  /// Plans the input splits of a job according to its connection strategy.
  ///
  /// With [`ConnectionStrategy::ClusterTopology`] the partition count comes
  /// from the probe and is divided with [`SplitPlanner::plan`]. With
  /// [`ConnectionStrategy::DirectServer`] every configured location becomes
  /// one split sized by the node's reported item count; `parallelism` does not
  /// apply.
  pub async fn plan_job<T>(config: &DumpConfig, probe: &T) -> Result<Vec<InputSplit>>
  where
    T: TopologyProbe + ?Sized,
  {
    config.validate()?;
    match config.strategy {
      ConnectionStrategy::ClusterTopology => {
        let partitions = probe.partition_count(config).await?;
        let splits = Self::plan(partitions, config.parallelism)?;
        debug!(
          partitions,
          parallelism = config.parallelism,
          splits = splits.len(),
          "planned partition splits"
        );
        Ok(splits.into_iter().map(InputSplit::Partitions).collect())
      }
      ConnectionStrategy::DirectServer => {
        let counts = probe.node_item_counts(config).await?;
        let splits: Vec<InputSplit> = config
          .locations
          .iter()
          .map(|location| InputSplit::Server {
            location: location.clone(),
            estimated_items: counts
              .iter()
              .find(|c| &c.location == location)
              .map(|c| c.items)
              .unwrap_or(0),
          })
          .collect();
        debug!(splits = splits.len(), "planned direct server splits");
        Ok(splits)
      }
    }
  }
}
