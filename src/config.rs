//! Configuration for dump jobs.
//!
//! [`DumpConfig`] is the typed view used by the planner and the workers.
//! [`JobConf`] is the string-keyed property map a batch framework carries
//! between driver and tasks; [`DumpConfig::from_job_conf`] reads the typed
//! view back out of it.

use crate::error::{DumpError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Job key holding the comma separated cluster locations.
pub const LOCATIONS_KEY: &str = "kvweave.locations";
/// Job key holding the bucket to dump.
pub const BUCKET_KEY: &str = "kvweave.bucket";
/// Job key holding the bucket credential.
pub const PASSWORD_KEY: &str = "kvweave.password";
/// Job key holding the requested number of splits.
pub const PARALLELISM_KEY: &str = "kvweave.parallelism";
/// Job key selecting the connection strategy (`cluster` or `direct`).
pub const STRATEGY_KEY: &str = "kvweave.strategy";
/// Job key enabling mutation events after the dump.
pub const MUTATIONS_KEY: &str = "kvweave.mutations";
/// Job key for the first poll backoff step, in milliseconds.
pub const BACKOFF_INITIAL_KEY: &str = "kvweave.backoff.initial_ms";
/// Job key for the poll backoff ceiling, in milliseconds.
pub const BACKOFF_MAX_KEY: &str = "kvweave.backoff.max_ms";
/// Job key for the connect timeout, in milliseconds.
pub const CONNECT_TIMEOUT_KEY: &str = "kvweave.connect_timeout_ms";

/// Bucket dumped when none is configured.
pub const DEFAULT_BUCKET: &str = "default";

/// How workers reach the data.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStrategy {
  /// Ask the cluster for its partition map and split the partitions.
  #[default]
  ClusterTopology,
  /// Dump each configured node as a whole, one split per node.
  DirectServer,
}

impl ConnectionStrategy {
  /// Parses the value stored under [`STRATEGY_KEY`].
  pub fn parse(value: &str) -> Result<Self> {
    match value.trim().to_ascii_lowercase().as_str() {
      "cluster" | "cluster_topology" => Ok(ConnectionStrategy::ClusterTopology),
      "direct" | "direct_server" => Ok(ConnectionStrategy::DirectServer),
      other => Err(DumpError::Configuration(format!(
        "unknown connection strategy '{}'",
        other
      ))),
    }
  }

  /// Returns the short name written under [`STRATEGY_KEY`].
  pub fn as_str(&self) -> &'static str {
    match self {
      ConnectionStrategy::ClusterTopology => "cluster",
      ConnectionStrategy::DirectServer => "direct",
    }
  }
}

/// Bounded exponential wait applied while a stream has nothing buffered.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct PollBackoff {
  /// First wait after an empty poll.
  #[serde(with = "duration_ms")]
  pub initial: Duration,
  /// Ceiling for the wait.
  #[serde(with = "duration_ms")]
  pub max: Duration,
}

impl Default for PollBackoff {
  fn default() -> Self {
    Self {
      initial: Duration::from_millis(1),
      max: Duration::from_millis(50),
    }
  }
}

impl PollBackoff {
  /// Creates a backoff with the given bounds.
  pub fn new(initial: Duration, max: Duration) -> Self {
    Self { initial, max }
  }

  /// Starts a fresh wait sequence.
  pub fn start(&self) -> BackoffSequence {
    BackoffSequence {
      next: self.initial,
      max: self.max,
    }
  }
}

/// Iterator-like sequence of waits produced by [`PollBackoff::start`].
#[derive(Clone, Debug)]
pub struct BackoffSequence {
  next: Duration,
  max: Duration,
}

impl BackoffSequence {
  /// Returns the next wait; doubles until it reaches the ceiling.
  pub fn next_delay(&mut self) -> Duration {
    let delay = self.next.min(self.max);
    self.next = self.next.saturating_mul(2).min(self.max);
    delay
  }
}

/// Typed configuration of a dump job.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DumpConfig {
  /// URIs of the store nodes or coordinator. Required.
  pub locations: Vec<String>,
  /// Logical dataset to dump.
  pub bucket: String,
  /// Authentication secret for the bucket.
  pub credential: String,
  /// Desired number of splits.
  pub parallelism: u32,
  /// How the planner and workers reach the data.
  pub strategy: ConnectionStrategy,
  /// Keep streaming mutation events after the dump completes.
  pub include_mutations: bool,
  /// Wait policy for empty polls.
  pub backoff: PollBackoff,
  /// Upper bound for establishing a stream.
  #[serde(with = "duration_ms")]
  pub connect_timeout: Duration,
}

impl Default for DumpConfig {
  fn default() -> Self {
    Self {
      locations: Vec::new(),
      bucket: DEFAULT_BUCKET.to_string(),
      credential: String::new(),
      parallelism: 1,
      strategy: ConnectionStrategy::default(),
      include_mutations: false,
      backoff: PollBackoff::default(),
      connect_timeout: Duration::from_secs(10),
    }
  }
}

impl DumpConfig {
  /// Creates a config for the given locations with defaults elsewhere.
  pub fn new<I, S>(locations: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      locations: locations.into_iter().map(Into::into).collect(),
      ..Default::default()
    }
  }

  /// Sets the bucket.
  #[must_use]
  pub fn with_bucket(mut self, bucket: impl Into<String>) -> Self {
    self.bucket = bucket.into();
    self
  }

  /// Sets the credential.
  #[must_use]
  pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
    self.credential = credential.into();
    self
  }

  /// Sets the number of splits to plan.
  #[must_use]
  pub fn with_parallelism(mut self, parallelism: u32) -> Self {
    self.parallelism = parallelism;
    self
  }

  /// Sets the connection strategy.
  #[must_use]
  pub fn with_strategy(mut self, strategy: ConnectionStrategy) -> Self {
    self.strategy = strategy;
    self
  }

  /// Enables or disables mutation events after the dump.
  #[must_use]
  pub fn with_mutations(mut self, include_mutations: bool) -> Self {
    self.include_mutations = include_mutations;
    self
  }

  /// Sets the empty-poll backoff.
  #[must_use]
  pub fn with_backoff(mut self, backoff: PollBackoff) -> Self {
    self.backoff = backoff;
    self
  }

  /// Sets the connect timeout.
  #[must_use]
  pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
    self.connect_timeout = timeout;
    self
  }

  /// Validates the config: locations present and well formed, parallelism >= 1,
  /// non-empty bucket, non-zero backoff no larger than its ceiling.
  pub fn validate(&self) -> Result<()> {
    if self.locations.is_empty() {
      return Err(DumpError::Configuration(
        "at least one cluster location is required".to_string(),
      ));
    }
    for location in &self.locations {
      parse_location(location)?;
    }
    if self.parallelism < 1 {
      return Err(DumpError::Configuration(format!(
        "parallelism must be >= 1, got {}",
        self.parallelism
      )));
    }
    if self.bucket.is_empty() {
      return Err(DumpError::Configuration("bucket must not be empty".to_string()));
    }
    if self.backoff.initial.is_zero() {
      return Err(DumpError::Configuration(
        "backoff initial must be > 0".to_string(),
      ));
    }
    if self.backoff.initial > self.backoff.max {
      return Err(DumpError::Configuration(format!(
        "backoff initial ({:?}) must be <= max ({:?})",
        self.backoff.initial, self.backoff.max
      )));
    }
    if self.connect_timeout.is_zero() {
      return Err(DumpError::Configuration(
        "connect timeout must be > 0".to_string(),
      ));
    }
    Ok(())
  }

  /// Parsed form of every configured location.
  pub fn parsed_locations(&self) -> Result<Vec<http::Uri>> {
    self.locations.iter().map(|l| parse_location(l)).collect()
  }

  /// Reads the typed config out of a job property map.
  ///
  /// Missing keys fall back to their defaults; present but malformed values are
  /// configuration errors. The result is not validated.
  pub fn from_job_conf(conf: &JobConf) -> Result<Self> {
    let defaults = Self::default();
    let backoff = PollBackoff {
      initial: conf
        .get_u64(BACKOFF_INITIAL_KEY)?
        .map(Duration::from_millis)
        .unwrap_or(defaults.backoff.initial),
      max: conf
        .get_u64(BACKOFF_MAX_KEY)?
        .map(Duration::from_millis)
        .unwrap_or(defaults.backoff.max),
    };
    Ok(Self {
      locations: conf.get_strings(LOCATIONS_KEY),
      bucket: conf.get_or(BUCKET_KEY, DEFAULT_BUCKET).to_string(),
      credential: conf.get_or(PASSWORD_KEY, "").to_string(),
      parallelism: conf.get_u32(PARALLELISM_KEY)?.unwrap_or(defaults.parallelism),
      strategy: conf
        .get(STRATEGY_KEY)
        .map(ConnectionStrategy::parse)
        .transpose()?
        .unwrap_or_default(),
      include_mutations: conf.get_bool(MUTATIONS_KEY)?.unwrap_or(false),
      backoff,
      connect_timeout: conf
        .get_u64(CONNECT_TIMEOUT_KEY)?
        .map(Duration::from_millis)
        .unwrap_or(defaults.connect_timeout),
    })
  }

  /// Writes every field of this config into a job property map.
  pub fn write_to(&self, conf: &mut JobConf) {
    conf.set_locations(&self.locations);
    conf.set_bucket(&self.bucket);
    conf.set_password(&self.credential);
    conf.set_parallelism(self.parallelism);
    conf.set(STRATEGY_KEY, self.strategy.as_str());
    conf.set(MUTATIONS_KEY, self.include_mutations.to_string());
    conf.set(BACKOFF_INITIAL_KEY, self.backoff.initial.as_millis().to_string());
    conf.set(BACKOFF_MAX_KEY, self.backoff.max.as_millis().to_string());
    conf.set(CONNECT_TIMEOUT_KEY, self.connect_timeout.as_millis().to_string());
  }
}

fn parse_location(location: &str) -> Result<http::Uri> {
  let uri: http::Uri = location.parse().map_err(|e| {
    DumpError::Configuration(format!("invalid URI in location '{}': {}", location, e))
  })?;
  if uri.scheme().is_none() || uri.host().is_none() {
    return Err(DumpError::Configuration(format!(
      "location '{}' must be an absolute URI with a host",
      location
    )));
  }
  Ok(uri)
}

/// String-keyed job properties shared between the driver and its tasks.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobConf {
  properties: BTreeMap<String, String>,
}

impl JobConf {
  /// Creates an empty property map.
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the raw value for `key`.
  pub fn get(&self, key: &str) -> Option<&str> {
    self.properties.get(key).map(String::as_str)
  }

  /// Returns the raw value for `key`, or `default`.
  pub fn get_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
    self.get(key).unwrap_or(default)
  }

  /// Stores a raw value.
  pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
    self.properties.insert(key.into(), value.into());
  }

  /// Reads a comma separated list; empty entries are dropped.
  pub fn get_strings(&self, key: &str) -> Vec<String> {
    self
      .get(key)
      .map(|v| {
        v.split(',')
          .map(str::trim)
          .filter(|s| !s.is_empty())
          .map(str::to_string)
          .collect()
      })
      .unwrap_or_default()
  }

  /// Reads an unsigned 32-bit integer.
  pub fn get_u32(&self, key: &str) -> Result<Option<u32>> {
    self.parse_with(key, |v| v.parse::<u32>().ok())
  }

  /// Reads an unsigned 64-bit integer.
  pub fn get_u64(&self, key: &str) -> Result<Option<u64>> {
    self.parse_with(key, |v| v.parse::<u64>().ok())
  }

  /// Reads a boolean (`true`/`false`).
  pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
    self.parse_with(key, |v| v.parse::<bool>().ok())
  }

  fn parse_with<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>> {
    match self.get(key) {
      None => Ok(None),
      Some(raw) => parse(raw.trim()).map(Some).ok_or_else(|| {
        DumpError::Configuration(format!("invalid value '{}' for {}", raw, key))
      }),
    }
  }

  /// Sets the cluster locations.
  pub fn set_locations<S: AsRef<str>>(&mut self, locations: &[S]) {
    let joined = locations
      .iter()
      .map(|l| l.as_ref())
      .collect::<Vec<_>>()
      .join(",");
    self.set(LOCATIONS_KEY, joined);
  }

  /// Sets the number of splits to plan.
  pub fn set_parallelism(&mut self, parallelism: u32) {
    self.set(PARALLELISM_KEY, parallelism.to_string());
  }

  /// Sets the bucket to dump.
  pub fn set_bucket(&mut self, bucket: &str) {
    self.set(BUCKET_KEY, bucket);
  }

  /// Sets the bucket credential.
  pub fn set_password(&mut self, password: &str) {
    self.set(PASSWORD_KEY, password);
  }
}

mod duration_ms {
  use serde::{Deserialize, Deserializer, Serializer};
  use std::time::Duration;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    u64::deserialize(d).map(Duration::from_millis)
  }
}
