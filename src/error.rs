//! # Error Handling
//!
//! Error taxonomy for planning, initializing and draining dump splits.
//!
//! Errors fall into two groups:
//!
//! - **Planning-time** errors ([`DumpError::Configuration`]) abort the whole job
//!   before any split is dispatched.
//! - **Runtime** errors ([`DumpError::Connection`], [`DumpError::Protocol`],
//!   [`DumpError::Cancelled`], [`DumpError::Encoding`]) are scoped to the split
//!   that raised them. Other splits keep running.
//!
//! Within one split there is no partial success: once a cursor fails it keeps
//! returning the same error, which is why [`DumpError`] is `Clone`.
//!
//! ## Example
//!
//! ```rust
//! use kvweave::error::{DumpError, ErrorKind};
//!
//! let error = DumpError::Protocol("stream reset by peer".to_string());
//! assert_eq!(error.kind(), ErrorKind::Protocol);
//! assert!(error.is_failure());
//! ```

use std::fmt;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T, E = DumpError> = std::result::Result<T, E>;

/// Error raised while planning a job or draining one of its splits.
#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum DumpError {
  /// Missing or invalid options: no locations, malformed URI, parallelism < 1,
  /// partition count out of range.
  #[error("configuration error: {0}")]
  Configuration(String),
  /// No reachable node, authentication failure or connect timeout.
  #[error("connection error: {0}")]
  Connection(String),
  /// The upstream stream reported a fault mid-stream.
  #[error("stream errored: {0}")]
  Protocol(String),
  /// The stream was aborted by an external cancellation request.
  #[error("stream cancelled")]
  Cancelled,
  /// Split bytes did not parse to the expected layout.
  #[error("encoding error: {0}")]
  Encoding(String),
}

impl DumpError {
  /// Returns the category of this error.
  pub fn kind(&self) -> ErrorKind {
    match self {
      DumpError::Configuration(_) => ErrorKind::Configuration,
      DumpError::Connection(_) => ErrorKind::Connection,
      DumpError::Protocol(_) => ErrorKind::Protocol,
      DumpError::Cancelled => ErrorKind::Cancelled,
      DumpError::Encoding(_) => ErrorKind::Encoding,
    }
  }

  /// True for errors that terminate an already running stream.
  pub fn is_failure(&self) -> bool {
    matches!(self, DumpError::Protocol(_) | DumpError::Cancelled)
  }

  /// True if the error was caused by external cancellation.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, DumpError::Cancelled)
  }
}

/// Category of a [`DumpError`], used as a stable label in logs and metrics.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ErrorKind {
  /// See [`DumpError::Configuration`].
  Configuration,
  /// See [`DumpError::Connection`].
  Connection,
  /// See [`DumpError::Protocol`].
  Protocol,
  /// See [`DumpError::Cancelled`].
  Cancelled,
  /// See [`DumpError::Encoding`].
  Encoding,
}

impl ErrorKind {
  /// Returns the lowercase label of this kind.
  pub fn as_str(&self) -> &'static str {
    match self {
      ErrorKind::Configuration => "configuration",
      ErrorKind::Connection => "connection",
      ErrorKind::Protocol => "protocol",
      ErrorKind::Cancelled => "cancelled",
      ErrorKind::Encoding => "encoding",
    }
  }
}

impl fmt::Display for ErrorKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Context information about when and where a split failed.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorContext {
  /// The timestamp when the error occurred.
  pub timestamp: chrono::DateTime<chrono::Utc>,
  /// Index of the split in the job plan.
  pub split_index: usize,
  /// The name of the component that encountered the error.
  pub component_name: String,
}

impl ErrorContext {
  /// Creates a context stamped with the current time.
  pub fn new(split_index: usize, component_name: impl Into<String>) -> Self {
    Self {
      timestamp: chrono::Utc::now(),
      split_index,
      component_name: component_name.into(),
    }
  }
}

/// A runtime error paired with the split it was scoped to.
#[derive(Clone, Debug, PartialEq)]
pub struct SplitFailure {
  /// The error that ended the split.
  pub error: DumpError,
  /// Where and when it happened.
  pub context: ErrorContext,
}

impl SplitFailure {
  /// Creates a new failure record.
  pub fn new(error: DumpError, context: ErrorContext) -> Self {
    Self { error, context }
  }
}

impl fmt::Display for SplitFailure {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "split {} failed in {}: {}",
      self.context.split_index, self.context.component_name, self.error
    )
  }
}

impl std::error::Error for SplitFailure {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    Some(&self.error)
  }
}
