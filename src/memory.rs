//! In-process partitioned key/value store.
//!
//! [`MemoryStore`] implements both upstream collaborators, [`TopologyProbe`]
//! and [`DumpClient`], on top of plain in-memory maps. It behaves like a small
//! cluster: keys hash to a fixed number of partitions, partitions are spread
//! over named nodes, and every opened stream is filled by its own tokio task
//! so that deliveries arrive asynchronously, exactly as a networked client
//! would deliver them.
//!
//! It is used by the demo job and the integration tests, and is handy for
//! exercising a job locally before pointing it at a real cluster.

use crate::config::DumpConfig;
use crate::error::{DumpError, Result};
use crate::session::{feed, DumpClient, DumpHandle, FeedHandle, FeedSender, PollResult, Record};
use crate::split::{InputSplit, PartitionId};
use crate::topology::{NodeItemCount, TopologyProbe};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const FEED_CAPACITY: usize = 256;
const MUTATION_CAPACITY: usize = 1024;

/// Builder for a [`MemoryStore`].
#[derive(Clone, Debug)]
pub struct MemoryStoreBuilder {
  partitions: u16,
  nodes: Vec<String>,
  bucket: String,
  credential: String,
  delivery_delay: Option<Duration>,
}

impl Default for MemoryStoreBuilder {
  fn default() -> Self {
    Self {
      partitions: 64,
      nodes: vec!["http://127.0.0.1:8091/pools".to_string()],
      bucket: crate::config::DEFAULT_BUCKET.to_string(),
      credential: String::new(),
      delivery_delay: None,
    }
  }
}

impl MemoryStoreBuilder {
  /// Sets the number of keyspace partitions (at least one).
  #[must_use]
  pub fn partitions(mut self, partitions: u16) -> Self {
    self.partitions = partitions.max(1);
    self
  }

  /// Sets the node locations; partitions are assigned to them round robin.
  #[must_use]
  pub fn nodes<I, S>(mut self, nodes: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.nodes = nodes.into_iter().map(Into::into).collect();
    self
  }

  /// Sets the bucket name clients must ask for.
  #[must_use]
  pub fn bucket(mut self, bucket: impl Into<String>) -> Self {
    self.bucket = bucket.into();
    self
  }

  /// Sets the credential clients must present.
  #[must_use]
  pub fn credential(mut self, credential: impl Into<String>) -> Self {
    self.credential = credential.into();
    self
  }

  /// Delays every delivery, so consumers see empty polls.
  #[must_use]
  pub fn delivery_delay(mut self, delay: Duration) -> Self {
    self.delivery_delay = Some(delay);
    self
  }

  /// Builds the store.
  pub fn build(self) -> MemoryStore {
    let (mutations, _) = broadcast::channel(MUTATION_CAPACITY);
    MemoryStore {
      inner: Arc::new(Inner {
        data: Mutex::new(vec![BTreeMap::new(); self.partitions as usize]),
        faults: Mutex::new(HashMap::new()),
        mutations,
        active_streams: AtomicUsize::new(0),
        opened_streams: AtomicUsize::new(0),
        config: self,
      }),
    }
  }
}

struct Inner {
  config: MemoryStoreBuilder,
  data: Mutex<Vec<BTreeMap<Bytes, Bytes>>>,
  faults: Mutex<HashMap<PartitionId, String>>,
  mutations: broadcast::Sender<(PartitionId, Record)>,
  active_streams: AtomicUsize,
  opened_streams: AtomicUsize,
}

/// A cheaply cloneable handle to an in-memory store.
#[derive(Clone)]
pub struct MemoryStore {
  inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("MemoryStore")
      .field("partitions", &self.inner.config.partitions)
      .field("nodes", &self.inner.config.nodes)
      .field("bucket", &self.inner.config.bucket)
      .finish()
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MemoryStore {
  /// Starts building a store.
  pub fn builder() -> MemoryStoreBuilder {
    MemoryStoreBuilder::default()
  }

  /// Number of keyspace partitions.
  pub fn partition_count(&self) -> u16 {
    self.inner.config.partitions
  }

  /// Node locations, in partition assignment order.
  pub fn nodes(&self) -> &[String] {
    &self.inner.config.nodes
  }

  /// Partition a key hashes to.
  pub fn partition_for_key(&self, key: &[u8]) -> PartitionId {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % self.inner.config.partitions as u64) as PartitionId
  }

  /// Partitions owned by the node at `location`.
  pub fn partitions_of_node(&self, location: &str) -> Option<Vec<PartitionId>> {
    let nodes = &self.inner.config.nodes;
    let index = nodes.iter().position(|n| n == location)?;
    Some(
      (0..self.inner.config.partitions)
        .filter(|p| *p as usize % nodes.len() == index)
        .collect(),
    )
  }

  /// Stores a value and publishes the write as a mutation event.
  pub fn put(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> PartitionId {
    let record = Record::new(key, value);
    let partition = self.partition_for_key(&record.key);
    lock(&self.inner.data)[partition as usize].insert(record.key.clone(), record.value.clone());
    // No subscribers is the common case outside mutation streams.
    let _ = self.inner.mutations.send((partition, record));
    partition
  }

  /// Total number of stored items.
  pub fn len(&self) -> usize {
    lock(&self.inner.data).iter().map(BTreeMap::len).sum()
  }

  /// True if the store holds no items.
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Makes every stream that covers `partition` fail with `cause` when it
  /// reaches that partition.
  pub fn inject_fault(&self, partition: PartitionId, cause: impl Into<String>) {
    lock(&self.inner.faults).insert(partition, cause.into());
  }

  /// Removes all injected faults.
  pub fn clear_faults(&self) {
    lock(&self.inner.faults).clear();
  }

  /// Streams currently open (opened and not yet closed).
  pub fn active_streams(&self) -> usize {
    self.inner.active_streams.load(Ordering::SeqCst)
  }

  /// Streams opened over the lifetime of the store.
  pub fn opened_streams(&self) -> usize {
    self.inner.opened_streams.load(Ordering::SeqCst)
  }

  fn authorize(&self, config: &DumpConfig) -> Result<()> {
    let store = &self.inner.config;
    if !config.locations.iter().any(|l| store.nodes.contains(l)) {
      return Err(DumpError::Connection(format!(
        "no reachable node among {:?}",
        config.locations
      )));
    }
    if config.bucket != store.bucket {
      return Err(DumpError::Connection(format!(
        "bucket '{}' does not exist",
        config.bucket
      )));
    }
    if config.credential != store.credential {
      return Err(DumpError::Connection(format!(
        "authentication failed for bucket '{}'",
        config.bucket
      )));
    }
    Ok(())
  }

  fn resolve(&self, split: &InputSplit) -> Result<Vec<PartitionId>> {
    match split {
      InputSplit::Partitions(descriptor) => {
        if let Some(id) = descriptor.iter().find(|id| *id >= self.inner.config.partitions) {
          return Err(DumpError::Connection(format!(
            "bucket has no partition {}",
            id
          )));
        }
        Ok(descriptor.partitions().to_vec())
      }
      InputSplit::Server { location, .. } => self
        .partitions_of_node(location)
        .ok_or_else(|| DumpError::Connection(format!("unknown node {}", location))),
    }
  }
}

#[async_trait]
impl TopologyProbe for MemoryStore {
  async fn partition_count(&self, config: &DumpConfig) -> Result<usize> {
    self.authorize(config)?;
    Ok(self.inner.config.partitions as usize)
  }

  async fn node_item_counts(&self, config: &DumpConfig) -> Result<Vec<NodeItemCount>> {
    self.authorize(config)?;
    let data = lock(&self.inner.data);
    Ok(
      config
        .locations
        .iter()
        .filter_map(|location| {
          let owned = self.partitions_of_node(location)?;
          let items = owned.iter().map(|p| data[*p as usize].len() as u64).sum();
          Some(NodeItemCount {
            location: location.clone(),
            items,
          })
        })
        .collect(),
    )
  }
}

#[async_trait]
impl DumpClient for MemoryStore {
  async fn open_stream(
    &self,
    split: &InputSplit,
    config: &DumpConfig,
    cancel: CancellationToken,
  ) -> Result<Box<dyn DumpHandle>> {
    self.authorize(config)?;
    let partitions = self.resolve(split)?;

    // Subscribe before snapshotting so no write falls between dump and tail.
    let mutations = config
      .include_mutations
      .then(|| self.inner.mutations.subscribe());
    let snapshot: Vec<(PartitionId, Vec<Record>)> = {
      let data = lock(&self.inner.data);
      partitions
        .iter()
        .map(|p| {
          let records = data[*p as usize]
            .iter()
            .map(|(k, v)| Record::new(k.clone(), v.clone()))
            .collect();
          (*p, records)
        })
        .collect()
    };
    let faults = lock(&self.inner.faults).clone();

    let (sender, handle) = feed(FEED_CAPACITY, cancel);
    let owned: HashSet<PartitionId> = partitions.into_iter().collect();
    tokio::spawn(fill_stream(
      sender,
      snapshot,
      faults,
      mutations.map(|rx| (rx, owned)),
      self.inner.config.delivery_delay,
    ));

    self.inner.opened_streams.fetch_add(1, Ordering::SeqCst);
    self.inner.active_streams.fetch_add(1, Ordering::SeqCst);
    debug!(split = %split, "memory store stream opened");
    Ok(Box::new(MemoryHandle {
      feed: handle,
      store: self.inner.clone(),
      closed: false,
    }))
  }
}

async fn fill_stream(
  sender: FeedSender,
  snapshot: Vec<(PartitionId, Vec<Record>)>,
  faults: HashMap<PartitionId, String>,
  mutations: Option<(broadcast::Receiver<(PartitionId, Record)>, HashSet<PartitionId>)>,
  delay: Option<Duration>,
) {
  for (partition, records) in snapshot {
    if let Some(cause) = faults.get(&partition) {
      let _ = sender
        .fail(format!("partition {}: {}", partition, cause))
        .await;
      return;
    }
    for record in records {
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      if sender.send(record).await.is_err() {
        return;
      }
    }
  }

  let Some((mut rx, owned)) = mutations else {
    let _ = sender.finish().await;
    return;
  };
  loop {
    tokio::select! {
      _ = sender.cancelled() => return,
      event = rx.recv() => match event {
        Ok((partition, record)) if owned.contains(&partition) => {
          if sender.send(record).await.is_err() {
            return;
          }
        }
        Ok(_) => {}
        Err(broadcast::error::RecvError::Lagged(missed)) => {
          let _ = sender
            .fail(format!("mutation stream lagged, {} events lost", missed))
            .await;
          return;
        }
        Err(broadcast::error::RecvError::Closed) => {
          let _ = sender.finish().await;
          return;
        }
      },
    }
  }
}

struct MemoryHandle {
  feed: FeedHandle,
  store: Arc<Inner>,
  closed: bool,
}

impl DumpHandle for MemoryHandle {
  fn poll(&mut self) -> PollResult {
    self.feed.poll()
  }

  fn close(&mut self) {
    if !self.closed {
      self.closed = true;
      self.feed.close();
      self.store.active_streams.fetch_sub(1, Ordering::SeqCst);
    }
  }
}

impl Drop for MemoryHandle {
  fn drop(&mut self) {
    self.close();
  }
}
