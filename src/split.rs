//! # Split Descriptors
//!
//! A [`SplitDescriptor`] is the unit of work handed to one worker: an ordered,
//! non-empty, duplicate-free set of partition IDs. It is produced by the
//! [planner](crate::partitioning::SplitPlanner), shipped to the worker in a fixed
//! binary layout, and never mutated afterwards.
//!
//! ## Wire format
//!
//! All integers are big-endian.
//!
//! ```text
//! [count: u16][partition_id: u16] x count
//! ```
//!
//! Under [`ConnectionStrategy::ClusterTopology`] these are the only bytes a
//! worker receives. A [`ConnectionStrategy::DirectServer`] split names one node
//! instead:
//!
//! ```text
//! [len: u16][location: utf-8 x len][estimated_items: u64]
//! ```
//!
//! Nothing in the bytes says which layout they use; both sides read it from the
//! job's configured strategy.

use crate::config::ConnectionStrategy;
use crate::error::{DumpError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Identifier of one fixed keyspace partition of the store.
pub type PartitionId = u16;

/// Largest number of entries a descriptor can carry (bounded by the `u16` count).
pub const MAX_DESCRIPTOR_LEN: usize = u16::MAX as usize;

/// Ordered, immutable set of partitions assigned to a single worker.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<PartitionId>", into = "Vec<PartitionId>")]
pub struct SplitDescriptor {
  partitions: Vec<PartitionId>,
}

impl SplitDescriptor {
  /// Creates a descriptor from an ordered list of partition IDs.
  ///
  /// # Errors
  ///
  /// Returns [`DumpError::Encoding`] if the list is empty, longer than
  /// [`MAX_DESCRIPTOR_LEN`], or names a partition twice.
  pub fn new(partitions: Vec<PartitionId>) -> Result<Self> {
    if partitions.is_empty() {
      return Err(DumpError::Encoding(
        "split descriptor must name at least one partition".to_string(),
      ));
    }
    if partitions.len() > MAX_DESCRIPTOR_LEN {
      return Err(DumpError::Encoding(format!(
        "split descriptor holds {} partitions, at most {} fit the count field",
        partitions.len(),
        MAX_DESCRIPTOR_LEN
      )));
    }
    let mut seen = HashSet::with_capacity(partitions.len());
    for id in &partitions {
      if !seen.insert(*id) {
        return Err(DumpError::Encoding(format!(
          "partition {} listed twice in split descriptor",
          id
        )));
      }
    }
    Ok(Self { partitions })
  }

  /// Builds a descriptor from a contiguous range produced by the planner.
  pub(crate) fn from_range(range: std::ops::Range<PartitionId>) -> Self {
    debug_assert!(!range.is_empty());
    Self {
      partitions: range.collect(),
    }
  }

  /// Returns the partitions in planned order.
  pub fn partitions(&self) -> &[PartitionId] {
    &self.partitions
  }

  /// Number of partitions in this descriptor.
  pub fn len(&self) -> usize {
    self.partitions.len()
  }

  /// Always false for a constructed descriptor.
  pub fn is_empty(&self) -> bool {
    self.partitions.is_empty()
  }

  /// Returns true if `id` belongs to this split.
  pub fn contains(&self, id: PartitionId) -> bool {
    self.partitions.contains(&id)
  }

  /// Iterates over the partitions in planned order.
  pub fn iter(&self) -> impl Iterator<Item = PartitionId> + '_ {
    self.partitions.iter().copied()
  }

  /// Size in bytes of the encoded form.
  pub fn encoded_len(&self) -> usize {
    2 + 2 * self.partitions.len()
  }

  /// Encodes the descriptor as `[count: u16][id: u16] x count`.
  pub fn encode(&self) -> Bytes {
    let mut buf = BytesMut::with_capacity(self.encoded_len());
    self.encode_into(&mut buf);
    buf.freeze()
  }

  fn encode_into(&self, buf: &mut BytesMut) {
    // Length is bounded by MAX_DESCRIPTOR_LEN at construction.
    buf.put_u16(self.partitions.len() as u16);
    for id in &self.partitions {
      buf.put_u16(*id);
    }
  }

  /// Decodes a descriptor, requiring the input to be consumed exactly.
  ///
  /// # Errors
  ///
  /// Returns [`DumpError::Encoding`] on truncated input, trailing bytes, a zero
  /// count or duplicate partitions.
  pub fn decode(bytes: &[u8]) -> Result<Self> {
    let mut buf = bytes;
    let descriptor = Self::decode_from(&mut buf)?;
    if buf.has_remaining() {
      return Err(DumpError::Encoding(format!(
        "{} trailing bytes after split descriptor",
        buf.remaining()
      )));
    }
    Ok(descriptor)
  }

  fn decode_from(buf: &mut &[u8]) -> Result<Self> {
    if buf.remaining() < 2 {
      return Err(DumpError::Encoding(
        "split descriptor is missing its count field".to_string(),
      ));
    }
    let count = buf.get_u16() as usize;
    if buf.remaining() < count * 2 {
      return Err(DumpError::Encoding(format!(
        "split descriptor announces {} partitions but only {} bytes follow",
        count,
        buf.remaining()
      )));
    }
    let partitions = (0..count).map(|_| buf.get_u16()).collect();
    Self::new(partitions)
  }
}

impl TryFrom<Vec<PartitionId>> for SplitDescriptor {
  type Error = DumpError;

  fn try_from(partitions: Vec<PartitionId>) -> Result<Self> {
    Self::new(partitions)
  }
}

impl From<SplitDescriptor> for Vec<PartitionId> {
  fn from(descriptor: SplitDescriptor) -> Self {
    descriptor.partitions
  }
}

impl fmt::Display for SplitDescriptor {
  /// Prints contiguous runs compactly, e.g. `[0-3, 7, 9-10]`.
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str("[")?;
    let mut first = true;
    let mut i = 0;
    while i < self.partitions.len() {
      let start = self.partitions[i];
      let mut end = start;
      while i + 1 < self.partitions.len() && self.partitions[i + 1] == end.wrapping_add(1) {
        i += 1;
        end = self.partitions[i];
      }
      if !first {
        f.write_str(", ")?;
      }
      first = false;
      if start == end {
        write!(f, "{}", start)?;
      } else {
        write!(f, "{}-{}", start, end)?;
      }
      i += 1;
    }
    f.write_str("]")
  }
}

/// One unit of work, tagged by the connection strategy it was planned with.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum InputSplit {
  /// A set of keyspace partitions dumped through the cluster topology.
  Partitions(SplitDescriptor),
  /// Everything held by one storage node, dumped by connecting to it directly.
  Server {
    /// Location of the node.
    location: String,
    /// Item count the node reported at planning time.
    estimated_items: u64,
  },
}

impl InputSplit {
  /// Size of the split: partition count, or estimated items for a server split.
  pub fn length(&self) -> u64 {
    match self {
      InputSplit::Partitions(descriptor) => descriptor.len() as u64,
      InputSplit::Server {
        estimated_items, ..
      } => *estimated_items,
    }
  }

  /// Placement hints for the scheduler.
  ///
  /// Partition splits carry none because the store does not expose where
  /// partitions live.
  pub fn location_hints(&self) -> Vec<String> {
    match self {
      InputSplit::Partitions(_) => Vec::new(),
      InputSplit::Server { location, .. } => vec![location.clone()],
    }
  }

  /// Returns the descriptor of a partition split.
  pub fn descriptor(&self) -> Option<&SplitDescriptor> {
    match self {
      InputSplit::Partitions(descriptor) => Some(descriptor),
      InputSplit::Server { .. } => None,
    }
  }

  /// Strategy whose wire layout this split uses.
  pub fn strategy(&self) -> ConnectionStrategy {
    match self {
      InputSplit::Partitions(_) => ConnectionStrategy::ClusterTopology,
      InputSplit::Server { .. } => ConnectionStrategy::DirectServer,
    }
  }

  /// Encodes the split in the layout of its strategy.
  ///
  /// A partition split encodes to exactly [`SplitDescriptor::encode`].
  ///
  /// # Errors
  ///
  /// Returns [`DumpError::Encoding`] if a server location does not fit the
  /// `u16` length field.
  pub fn encode(&self) -> Result<Bytes> {
    match self {
      InputSplit::Partitions(descriptor) => Ok(descriptor.encode()),
      InputSplit::Server {
        location,
        estimated_items,
      } => {
        let len = u16::try_from(location.len()).map_err(|_| {
          DumpError::Encoding(format!(
            "server location is {} bytes, longer than {}",
            location.len(),
            u16::MAX
          ))
        })?;
        let mut buf = BytesMut::with_capacity(2 + location.len() + 8);
        buf.put_u16(len);
        buf.put_slice(location.as_bytes());
        buf.put_u64(*estimated_items);
        Ok(buf.freeze())
      }
    }
  }

  /// Decodes bytes produced by [`InputSplit::encode`] for a job planned with
  /// `strategy`.
  ///
  /// # Errors
  ///
  /// Returns [`DumpError::Encoding`] for truncated or trailing bytes, invalid
  /// UTF-8 or an invalid descriptor.
  pub fn decode(bytes: &[u8], strategy: ConnectionStrategy) -> Result<Self> {
    match strategy {
      ConnectionStrategy::ClusterTopology => {
        SplitDescriptor::decode(bytes).map(InputSplit::Partitions)
      }
      ConnectionStrategy::DirectServer => Self::decode_server(bytes),
    }
  }

  fn decode_server(bytes: &[u8]) -> Result<Self> {
    let mut buf = bytes;
    if buf.remaining() < 2 {
      return Err(DumpError::Encoding(
        "server split is missing its location length".to_string(),
      ));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len + 8 {
      return Err(DumpError::Encoding("server split is truncated".to_string()));
    }
    let location = std::str::from_utf8(&buf[..len])
      .map_err(|e| DumpError::Encoding(format!("server location is not utf-8: {}", e)))?
      .to_string();
    buf.advance(len);
    let estimated_items = buf.get_u64();
    if buf.has_remaining() {
      return Err(DumpError::Encoding(format!(
        "{} trailing bytes after server split",
        buf.remaining()
      )));
    }
    Ok(InputSplit::Server {
      location,
      estimated_items,
    })
  }
}

impl From<SplitDescriptor> for InputSplit {
  fn from(descriptor: SplitDescriptor) -> Self {
    InputSplit::Partitions(descriptor)
  }
}

impl fmt::Display for InputSplit {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      InputSplit::Partitions(descriptor) => write!(f, "partitions {}", descriptor),
      InputSplit::Server { location, .. } => write!(f, "server {}", location),
    }
  }
}
