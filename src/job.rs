//! Job driver: the batch-framework side of a dump.
//!
//! A [`DumpJob`] plans its splits exactly once, before any work starts, and
//! then runs one independent worker per split. Workers share nothing: each one
//! decodes its own split bytes, opens its own session, drains its cursor into
//! its own [`RecordSink`] and reports its own [`CursorStats`].
//!
//! ## Usage
//!
//! ```rust,no_run
//! use kvweave::config::DumpConfig;
//! use kvweave::job::DumpJob;
//! use kvweave::memory::MemoryStore;
//! use kvweave::session::Record;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), kvweave::error::DumpError> {
//! let store = Arc::new(MemoryStore::builder().partitions(16).build());
//! let config = DumpConfig::new(store.nodes().to_vec()).with_parallelism(4);
//!
//! let job = DumpJob::new("count-keys", config)?;
//! let plan = job.plan(store.as_ref()).await?;
//! let report = job
//!   .run(&plan, store.clone(), |_split| {
//!     let mut seen = 0u64;
//!     move |_record: Record| seen += 1
//!   })
//!   .await;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

use crate::config::DumpConfig;
use crate::cursor::{CursorStats, RecordCursor};
use crate::error::{DumpError, ErrorContext, Result, SplitFailure};
use crate::metrics;
use crate::partitioning::SplitPlanner;
use crate::session::{DumpClient, Record, StreamSession};
use crate::split::InputSplit;
use crate::topology::TopologyProbe;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives the records of one split.
///
/// A fresh sink is built for every split, so implementations can keep local
/// state without synchronization.
pub trait RecordSink: Send + 'static {
  /// Handles one delivered record.
  fn accept(&mut self, record: Record);

  /// Called once after the split ends, whether it succeeded or not.
  fn finish(&mut self) {}
}

impl<F> RecordSink for F
where
  F: FnMut(Record) + Send + 'static,
{
  fn accept(&mut self, record: Record) {
    self(record)
  }
}

/// Splits of a job, in planned order, together with their wire form.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobPlan {
  splits: Vec<InputSplit>,
  encoded: Vec<Bytes>,
}

impl JobPlan {
  /// Builds a plan, encoding every split.
  ///
  /// # Errors
  ///
  /// [`DumpError::Encoding`] if a split cannot be encoded.
  pub fn new(splits: Vec<InputSplit>) -> Result<Self> {
    let encoded = splits
      .iter()
      .map(InputSplit::encode)
      .collect::<Result<Vec<_>>>()?;
    Ok(Self { splits, encoded })
  }

  /// The planned splits.
  pub fn splits(&self) -> &[InputSplit] {
    &self.splits
  }

  /// Encoded bytes of split `index`, as shipped to its worker.
  ///
  /// Partition splits encode to their bare descriptor layout.
  pub fn encoded(&self, index: usize) -> Option<&Bytes> {
    self.encoded.get(index)
  }

  /// Number of splits.
  pub fn len(&self) -> usize {
    self.splits.len()
  }

  /// True if there is no work to do.
  pub fn is_empty(&self) -> bool {
    self.splits.is_empty()
  }
}

/// Result of one split.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitReport {
  /// Index of the split in the plan.
  pub index: usize,
  /// Counters accumulated by the split's cursor.
  pub stats: CursorStats,
  /// Set if the split did not run to exhaustion.
  pub failure: Option<SplitFailure>,
}

impl SplitReport {
  /// True if the split was drained completely.
  pub fn is_success(&self) -> bool {
    self.failure.is_none()
  }
}

/// Result of a whole job.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobReport {
  /// One report per planned split, in plan order.
  pub splits: Vec<SplitReport>,
}

impl JobReport {
  /// True if every split succeeded.
  pub fn is_success(&self) -> bool {
    self.splits.iter().all(SplitReport::is_success)
  }

  /// Records delivered across all splits.
  pub fn total_records(&self) -> u64 {
    self.splits.iter().map(|s| s.stats.records).sum()
  }

  /// Failures, in plan order.
  pub fn failures(&self) -> impl Iterator<Item = &SplitFailure> {
    self.splits.iter().filter_map(|s| s.failure.as_ref())
  }
}

/// A configured dump job.
#[derive(Debug)]
pub struct DumpJob {
  name: String,
  config: DumpConfig,
  cancel: CancellationToken,
}

impl DumpJob {
  /// Creates a job, validating its configuration up front.
  ///
  /// # Errors
  ///
  /// [`DumpError::Configuration`] for invalid options; no work is started.
  pub fn new(name: impl Into<String>, config: DumpConfig) -> Result<Self> {
    config.validate()?;
    Ok(Self {
      name: name.into(),
      config,
      cancel: CancellationToken::new(),
    })
  }

  /// The job name used in logs and metrics.
  pub fn name(&self) -> &str {
    &self.name
  }

  /// The job configuration.
  pub fn config(&self) -> &DumpConfig {
    &self.config
  }

  /// Token that cancels every split of this job.
  pub fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Requests cancellation of all running splits.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// Plans the job's splits.
  ///
  /// # Errors
  ///
  /// Any planning error aborts the job before a split is dispatched.
  pub async fn plan<T>(&self, probe: &T) -> Result<JobPlan>
  where
    T: TopologyProbe + ?Sized,
  {
    let plan = SplitPlanner::plan_job(&self.config, probe)
      .await
      .and_then(JobPlan::new)
      .inspect_err(|e| error!(job = %self.name, error = %e, "planning failed"))?;
    metrics::record_plan(&self.name, plan.len());
    info!(
      job = %self.name,
      splits = plan.len(),
      strategy = self.config.strategy.as_str(),
      "job planned"
    );
    Ok(plan)
  }

  /// Runs one worker per split and waits for all of them.
  ///
  /// `sink_for` is called once per split index to build that split's sink. A
  /// failing split does not affect the others.
  pub async fn run<C, F, S>(&self, plan: &JobPlan, client: Arc<C>, mut sink_for: F) -> JobReport
  where
    C: DumpClient + 'static,
    F: FnMut(usize) -> S,
    S: RecordSink,
  {
    let mut workers = Vec::with_capacity(plan.len());
    for (index, bytes) in plan.encoded.iter().enumerate() {
      let worker = run_split(
        self.name.clone(),
        index,
        bytes.clone(),
        self.config.clone(),
        client.clone(),
        sink_for(index),
        self.cancel.child_token(),
      );
      workers.push(tokio::spawn(worker));
    }

    let mut report = JobReport::default();
    for (index, worker) in workers.into_iter().enumerate() {
      let split = match worker.await {
        Ok(split) => split,
        Err(join_error) => {
          let error = DumpError::Protocol(format!("worker task failed: {}", join_error));
          metrics::record_split_failed(&self.name, error.kind());
          SplitReport {
            index,
            stats: CursorStats::default(),
            failure: Some(SplitFailure::new(
              error,
              ErrorContext::new(index, self.name.clone()),
            )),
          }
        }
      };
      report.splits.push(split);
    }
    info!(
      job = %self.name,
      records = report.total_records(),
      failed = report.failures().count(),
      "job finished"
    );
    report
  }
}

/// One worker: a cursor bound to a decoded split.
#[derive(Debug)]
pub struct SplitWorker {
  index: usize,
  cursor: RecordCursor,
}

impl SplitWorker {
  /// Decodes `bytes` and opens a session for the split they describe.
  ///
  /// Under [`ClusterTopology`](crate::config::ConnectionStrategy::ClusterTopology)
  /// `bytes` is a bare descriptor, `[count: u16][partition: u16] x count`.
  ///
  /// # Errors
  ///
  /// [`DumpError::Encoding`] for malformed bytes, [`DumpError::Connection`] if
  /// the stream cannot be opened.
  pub async fn initialize<C>(
    index: usize,
    bytes: &[u8],
    config: &DumpConfig,
    client: &C,
    cancel: CancellationToken,
  ) -> Result<Self>
  where
    C: DumpClient + ?Sized,
  {
    let split = InputSplit::decode(bytes, config.strategy)?;
    debug!(split = index, target = %split, "initializing split");
    let session = StreamSession::open_with_token(client, split, config, cancel).await?;
    Ok(Self {
      index,
      cursor: RecordCursor::with_backoff(session, config.backoff),
    })
  }

  /// Index of the split in the plan.
  pub fn index(&self) -> usize {
    self.index
  }

  /// The worker's cursor.
  pub fn cursor(&mut self) -> &mut RecordCursor {
    &mut self.cursor
  }

  /// Drains the cursor into `sink` and closes it.
  ///
  /// Returns the cursor's counters, or the error that ended the split.
  pub async fn drain<S>(&mut self, sink: &mut S) -> std::result::Result<CursorStats, DumpError>
  where
    S: RecordSink + ?Sized,
  {
    let outcome = loop {
      match self.cursor.advance().await {
        Ok(true) => {
          if let Some(record) = self.cursor.take_current() {
            sink.accept(record);
          }
        }
        Ok(false) => break Ok(()),
        Err(error) => break Err(error),
      }
    };
    self.cursor.close();
    sink.finish();
    outcome.map(|()| self.cursor.stats())
  }
}

async fn run_split<C, S>(
  job: String,
  index: usize,
  bytes: Bytes,
  config: DumpConfig,
  client: Arc<C>,
  mut sink: S,
  cancel: CancellationToken,
) -> SplitReport
where
  C: DumpClient + 'static,
  S: RecordSink,
{
  let fail = |error: DumpError, stats: CursorStats| {
    warn!(job = %job, split = index, error = %error, "split failed");
    metrics::record_split_failed(&job, error.kind());
    metrics::record_split_completed(&job, index, &stats);
    SplitReport {
      index,
      stats,
      failure: Some(SplitFailure::new(error, ErrorContext::new(index, job.clone()))),
    }
  };

  let mut worker =
    match SplitWorker::initialize(index, &bytes, &config, client.as_ref(), cancel).await {
      Ok(worker) => worker,
      Err(error) => {
        sink.finish();
        return fail(error, CursorStats::default());
      }
    };

  match worker.drain(&mut sink).await {
    Ok(stats) => {
      debug!(job = %job, split = index, records = stats.records, "split exhausted");
      metrics::record_split_completed(&job, index, &stats);
      SplitReport {
        index,
        stats,
        failure: None,
      }
    }
    Err(error) => {
      let stats = worker.cursor.stats();
      fail(error, stats)
    }
  }
}
