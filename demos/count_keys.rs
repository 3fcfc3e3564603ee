//! # Count keys
//!
//! Dumps an in-process store with a parallel job and counts the keys each
//! split delivered, the way a map-only batch job would.
//!
//! Demonstrates:
//! - **Planning**: a [`JobConf`] is turned into a typed config and planned once.
//! - **Per-split sinks**: every split gets its own [`RecordSink`], with no
//!   shared state between workers.
//! - **Observability**: `tracing` logs via `tracing_subscriber`, Prometheus
//!   metrics on `127.0.0.1:9091/metrics`.
//!
//! Run with `cargo run --example count_keys`.

use kvweave::config::{DumpConfig, JobConf};
use kvweave::job::{DumpJob, RecordSink};
use kvweave::memory::MemoryStore;
use kvweave::metrics;
use kvweave::session::Record;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Counts records and reports the total when its split ends.
struct KeyCounter {
  split: usize,
  keys: u64,
  bytes: u64,
  totals: mpsc::UnboundedSender<(usize, u64, u64)>,
}

impl RecordSink for KeyCounter {
  fn accept(&mut self, record: Record) {
    self.keys += 1;
    self.bytes += record.value.len() as u64;
  }

  fn finish(&mut self) {
    let _ = self.totals.send((self.split, self.keys, self.bytes));
  }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
  tracing_subscriber::fmt::init();

  let metrics_addr: SocketAddr = "127.0.0.1:9091".parse()?;
  metrics::install_prometheus_recorder_on(metrics_addr);

  let store = Arc::new(
    MemoryStore::builder()
      .partitions(1024)
      .nodes(["http://10.0.0.1:8091/pools", "http://10.0.0.2:8091/pools"])
      .bucket("beer-sample")
      .build(),
  );
  for i in 0..10_000 {
    store.put(format!("beer:{i:05}"), format!("{{\"abv\":{}}}", i % 12));
  }

  let mut conf = JobConf::new();
  conf.set_locations(store.nodes());
  conf.set_bucket("beer-sample");
  conf.set_parallelism(8);

  let job = DumpJob::new("count-keys", DumpConfig::from_job_conf(&conf)?)?;
  let plan = job.plan(store.as_ref()).await?;
  for split in plan.splits() {
    println!("planned {}", split);
  }

  let (totals, mut results) = mpsc::unbounded_channel();
  let report = job
    .run(&plan, store.clone(), |split| KeyCounter {
      split,
      keys: 0,
      bytes: 0,
      totals: totals.clone(),
    })
    .await;
  drop(totals);

  let mut per_split = Vec::new();
  while let Some(total) = results.recv().await {
    per_split.push(total);
  }
  per_split.sort_unstable();
  for (split, keys, bytes) in per_split {
    println!("split {split}: {keys} keys, {bytes} value bytes");
  }

  for failure in report.failures() {
    eprintln!("{failure}");
  }
  println!(
    "dumped {} of {} keys with {} splits",
    report.total_records(),
    store.len(),
    report.splits.len()
  );
  Ok(())
}
