//! # kvweave
//!
//! Parallel, pull-based ingestion of a partitioned key/value store's full
//! contents for batch jobs.
//!
//! A job is planned once: the store's fixed keyspace partitions are divided
//! into balanced, disjoint splits. Each split is then drained by an
//! independent worker through a [`RecordCursor`](cursor::RecordCursor), which
//! turns the store's asynchronous dump stream into a simple
//! `advance()`/`current()` loop with deterministic end-of-stream and failure
//! semantics.
//!
//! ## Key Features
//!
//! - **Balanced planning**: `min(N, P)` non-empty splits whose sizes differ by
//!   at most one and which cover every partition exactly once
//! - **Stable wire format**: splits travel to workers as
//!   `[count: u16][partition: u16] x count`
//! - **Sticky termination**: exhausted cursors stay exhausted, failed cursors
//!   keep failing with the same error
//! - **Cancellation aware**: an aborted stream surfaces within one backoff step
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use kvweave::config::DumpConfig;
//! use kvweave::job::DumpJob;
//! use kvweave::memory::MemoryStore;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), kvweave::error::DumpError> {
//! let store = Arc::new(MemoryStore::builder().partitions(1024).build());
//! store.put("user:1", "alice");
//!
//! let config = DumpConfig::new(store.nodes().to_vec()).with_parallelism(8);
//! let job = DumpJob::new("export", config)?;
//! let plan = job.plan(store.as_ref()).await?;
//! let report = job
//!   .run(&plan, store.clone(), |_| |_record: kvweave::Record| {})
//!   .await;
//! assert_eq!(report.total_records(), 1);
//! # Ok(())
//! # }
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Typed job options and the string-keyed job property map.
pub mod config;
/// Pull iterator over a stream session.
pub mod cursor;
/// Error taxonomy for planning and streaming.
pub mod error;
/// Job driver: plan once, run one worker per split.
pub mod job;
/// In-process partitioned store implementing the upstream collaborators.
pub mod memory;
/// Prometheus-compatible metrics emitted at worker completion.
pub mod metrics;
/// Split planning over the store's keyspace partitions.
pub mod partitioning;
/// Stream sessions and the upstream dump protocol boundary.
pub mod session;
/// Split descriptors and their wire encoding.
pub mod split;
/// Topology probing.
pub mod topology;

pub use config::{ConnectionStrategy, DumpConfig, JobConf, PollBackoff};
pub use cursor::{CursorStats, RecordCursor};
pub use error::{DumpError, ErrorKind};
pub use job::{DumpJob, JobPlan, JobReport, RecordSink, SplitReport, SplitWorker};
pub use partitioning::SplitPlanner;
pub use session::{DumpClient, DumpHandle, PollResult, Record, StreamSession, StreamState};
pub use split::{InputSplit, PartitionId, SplitDescriptor};
pub use topology::TopologyProbe;

#[cfg(test)]
mod cursor_test;
#[cfg(test)]
mod session_test;
