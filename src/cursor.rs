//! # Record Cursor
//!
//! Pull-style iteration over a [`StreamSession`].
//!
//! [`RecordCursor::advance`] polls the session until it sees a record, the end
//! of the stream, or a failure. `Empty` polls are never surfaced: they only
//! mean "retry", and the cursor waits with a bounded exponential backoff before
//! polling again. The wait is cut short by cancellation, so an aborted stream
//! surfaces as [`DumpError::Cancelled`] within one backoff step.
//!
//! Termination is sticky. After the stream is exhausted `advance` keeps
//! returning `false`; after a failure it keeps returning the same error.
//!
//! ## Example
//!
//! ```rust,no_run
//! use kvweave::cursor::RecordCursor;
//! use kvweave::session::StreamSession;
//! # async fn run(session: StreamSession) -> Result<(), kvweave::error::DumpError> {
//! let mut cursor = RecordCursor::new(session);
//! while cursor.advance().await? {
//!   if let Some(record) = cursor.current() {
//!     println!("{:?} => {} bytes", record.key, record.value.len());
//!   }
//! }
//! cursor.close();
//! # Ok(())
//! # }
//! ```

use crate::config::PollBackoff;
use crate::error::DumpError;
use crate::session::{PollResult, Record, StreamSession, StreamState};
use async_stream::stream;
use futures::Stream;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Boxed stream of records produced by [`RecordCursor::into_stream`].
pub type RecordStream = Pin<Box<dyn Stream<Item = Result<Record, DumpError>> + Send>>;

/// Local tally of what one cursor delivered.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CursorStats {
  /// Records handed to the caller.
  pub records: u64,
  /// Sum of key lengths.
  pub key_bytes: u64,
  /// Sum of value lengths.
  pub value_bytes: u64,
  /// Polls that found nothing buffered.
  pub empty_polls: u64,
}

#[derive(Clone, Debug)]
enum Terminal {
  Exhausted,
  Failed(DumpError),
}

/// Pull iterator over one split's dump stream.
#[derive(Debug)]
pub struct RecordCursor {
  session: StreamSession,
  backoff: PollBackoff,
  current: Option<Record>,
  terminal: Option<Terminal>,
  stats: CursorStats,
}

impl RecordCursor {
  /// Wraps a session using the default backoff.
  pub fn new(session: StreamSession) -> Self {
    Self::with_backoff(session, PollBackoff::default())
  }

  /// Wraps a session with an explicit empty-poll backoff.
  pub fn with_backoff(session: StreamSession, backoff: PollBackoff) -> Self {
    Self {
      session,
      backoff,
      current: None,
      terminal: None,
      stats: CursorStats::default(),
    }
  }

  /// Moves to the next record.
  ///
  /// Returns `Ok(true)` when [`current`](Self::current) holds a new record and
  /// `Ok(false)` once the stream is exhausted.
  ///
  /// # Errors
  ///
  /// [`DumpError::Protocol`] when the stream errors and
  /// [`DumpError::Cancelled`] when it is aborted. Every later call returns the
  /// same error.
  pub async fn advance(&mut self) -> Result<bool, DumpError> {
    match &self.terminal {
      Some(Terminal::Exhausted) => return Ok(false),
      Some(Terminal::Failed(error)) => return Err(error.clone()),
      None => {}
    }

    let cancel = self.session.cancel_token();
    let mut delays = self.backoff.start();
    loop {
      match self.session.poll() {
        PollResult::Message(record) => {
          self.stats.records += 1;
          self.stats.key_bytes += record.key.len() as u64;
          self.stats.value_bytes += record.value.len() as u64;
          self.current = Some(record);
          return Ok(true);
        }
        PollResult::Empty => {
          self.stats.empty_polls += 1;
          let delay = delays.next_delay();
          tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
          }
        }
        PollResult::Exhausted => {
          self.current = None;
          self.terminal = Some(Terminal::Exhausted);
          return Ok(false);
        }
        PollResult::Errored(cause) => return Err(self.fail(DumpError::Protocol(cause))),
        PollResult::Cancelled => return Err(self.fail(DumpError::Cancelled)),
      }
    }
  }

  fn fail(&mut self, error: DumpError) -> DumpError {
    self.current = None;
    self.terminal = Some(Terminal::Failed(error.clone()));
    error
  }

  /// The record delivered by the last successful [`advance`](Self::advance).
  pub fn current(&self) -> Option<&Record> {
    self.current.as_ref()
  }

  /// Takes ownership of the current record.
  pub fn take_current(&mut self) -> Option<Record> {
    self.current.take()
  }

  /// Coarse progress: `0.0` until the stream is exhausted, then `1.0`.
  ///
  /// The protocol reports no remaining count, so this is advisory only.
  pub fn progress(&self) -> f32 {
    match self.terminal {
      Some(Terminal::Exhausted) => 1.0,
      _ => 0.0,
    }
  }

  /// Lifecycle state of the underlying session.
  pub fn state(&self) -> StreamState {
    self.session.state()
  }

  /// Counters accumulated by this cursor.
  pub fn stats(&self) -> CursorStats {
    self.stats
  }

  /// The session being iterated.
  pub fn session(&self) -> &StreamSession {
    &self.session
  }

  /// Token that aborts an in-flight or future [`advance`](Self::advance).
  ///
  /// Safe to trigger from another task; the owner should still call
  /// [`close`](Self::close) afterwards.
  pub fn cancel_token(&self) -> CancellationToken {
    self.session.cancel_token()
  }

  /// Releases the stream's connection. Idempotent and valid in any state.
  pub fn close(&mut self) {
    self.current = None;
    self.session.close();
  }

  /// Turns the cursor into a stream of records.
  ///
  /// The stream ends after the last record, or after yielding the first error.
  /// The session is closed when the stream ends.
  pub fn into_stream(self) -> RecordStream {
    let mut cursor = self;
    Box::pin(stream! {
      loop {
        match cursor.advance().await {
          Ok(true) => {
            if let Some(record) = cursor.take_current() {
              yield Ok(record);
            }
          }
          Ok(false) => break,
          Err(error) => {
            yield Err(error);
            break;
          }
        }
      }
      cursor.close();
    })
  }
}
