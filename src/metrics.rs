//! Prometheus/OpenTelemetry-compatible metrics for dump jobs.
//!
//! Workers keep their counters locally in
//! [`CursorStats`](crate::cursor::CursorStats) and report them here once, when
//! the split completes. Nothing in this crate keeps shared counters of its own.
//!
//! - [`record_split_completed`] feeds `kvweave_records_total`,
//!   `kvweave_record_bytes_total` and `kvweave_empty_polls_total`.
//! - [`record_split_failed`] feeds `kvweave_split_failures_total`, labelled by
//!   error kind so cancellations and protocol faults can be told apart.
//! - [`record_plan`] sets the `kvweave_planned_splits` gauge.
//!
//! If no recorder is installed, recording is a no-op.
//!
//! ```rust,no_run
//! kvweave::metrics::install_prometheus_recorder();
//! ```

use crate::cursor::CursorStats;
use crate::error::ErrorKind;
use metrics::{counter, gauge};

/// Installs the Prometheus recorder as the global metrics recorder.
///
/// Serves `GET /metrics` on the exporter's default address. Call once at
/// startup.
pub fn install_prometheus_recorder() {
  use metrics_exporter_prometheus::PrometheusBuilder;
  if let Err(e) = PrometheusBuilder::new().install() {
    tracing::warn!(error = %e, "failed to install Prometheus recorder");
  }
}

/// Installs the Prometheus recorder and serves metrics on the given address.
pub fn install_prometheus_recorder_on(addr: std::net::SocketAddr) {
  use metrics_exporter_prometheus::PrometheusBuilder;
  if let Err(e) = PrometheusBuilder::new().with_http_listener(addr).install() {
    tracing::warn!(error = %e, %addr, "failed to install Prometheus recorder");
  }
}

/// Records the number of splits a job was planned into.
pub fn record_plan(job: &str, splits: usize) {
  gauge!("kvweave_planned_splits", "job" => job.to_string()).set(splits as f64);
}

/// Reports the local counters of a split that ran to completion or failure.
pub fn record_split_completed(job: &str, split: usize, stats: &CursorStats) {
  let split = split.to_string();
  counter!(
    "kvweave_records_total",
    "job" => job.to_string(),
    "split" => split.clone()
  )
  .increment(stats.records);
  counter!(
    "kvweave_record_bytes_total",
    "job" => job.to_string(),
    "split" => split.clone()
  )
  .increment(stats.key_bytes + stats.value_bytes);
  counter!(
    "kvweave_empty_polls_total",
    "job" => job.to_string(),
    "split" => split
  )
  .increment(stats.empty_polls);
}

/// Records a split failure.
pub fn record_split_failed(job: &str, kind: ErrorKind) {
  counter!(
    "kvweave_split_failures_total",
    "job" => job.to_string(),
    "kind" => kind.as_str()
  )
  .increment(1);
}
