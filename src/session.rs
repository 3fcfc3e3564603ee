//! # Stream Sessions
//!
//! A [`StreamSession`] is the per-split runtime object. It opens one upstream
//! dump stream scoped to exactly the partitions of its split and exposes the
//! stream's tri-state delivery protocol as a non-blocking [`poll`]:
//!
//! - [`PollResult::Message`]: a record was buffered and is handed over;
//! - [`PollResult::Empty`]: nothing buffered yet, the stream is still live;
//! - [`PollResult::Exhausted`]: terminal success;
//! - [`PollResult::Errored`] / [`PollResult::Cancelled`]: terminal failure.
//!
//! The upstream protocol is reached through [`DumpClient`] and [`DumpHandle`].
//! Backends that fill a buffer from their own I/O tasks can use [`feed`] to
//! build a handle whose `poll` is a synchronized peek at that buffer.
//!
//! [`poll`]: StreamSession::poll

use crate::config::DumpConfig;
use crate::error::{DumpError, Result};
use crate::split::InputSplit;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A key/value pair delivered by a dump stream.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Record {
  /// Opaque key bytes.
  pub key: Bytes,
  /// Opaque value bytes.
  pub value: Bytes,
}

impl Record {
  /// Creates a record from anything convertible to [`Bytes`].
  pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
    Self {
      key: key.into(),
      value: value.into(),
    }
  }
}

/// Outcome of one non-blocking poll of a stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PollResult {
  /// A record is ready.
  Message(Record),
  /// Nothing is buffered, but the stream has not terminated. Retry later.
  Empty,
  /// No more records will ever arrive.
  Exhausted,
  /// The stream hit a protocol or connection fault.
  Errored(String),
  /// The stream was aborted on request.
  Cancelled,
}

impl PollResult {
  /// True for `Exhausted`, `Errored` and `Cancelled`.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      PollResult::Exhausted | PollResult::Errored(_) | PollResult::Cancelled
    )
  }
}

/// Lifecycle of a session/cursor pair.
///
/// `Created -> Subscribed -> Streaming -> {Exhausted | Errored | Cancelled}`;
/// nothing leaves a terminal state.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum StreamState {
  /// Constructed, not yet subscribed.
  Created,
  /// Upstream stream opened, nothing polled yet.
  Subscribed,
  /// At least one poll returned a message or empty.
  Streaming,
  /// Terminal success.
  Exhausted,
  /// Terminal protocol failure.
  Errored,
  /// Terminal external abort.
  Cancelled,
}

impl StreamState {
  /// True for the three terminal states.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      StreamState::Exhausted | StreamState::Errored | StreamState::Cancelled
    )
  }
}

/// Opens upstream dump streams.
///
/// Implemented by the store's client library; the session depends only on
/// `open_stream` here and on [`DumpHandle::poll`] / [`DumpHandle::close`].
#[async_trait]
pub trait DumpClient: Send + Sync {
  /// Opens a stream covering exactly `split`.
  ///
  /// `cancel` is fired when the session is cancelled or closed; backends should
  /// stop their I/O for this stream when it fires.
  ///
  /// # Errors
  ///
  /// [`DumpError::Connection`] if no node is reachable or authentication fails.
  async fn open_stream(
    &self,
    split: &InputSplit,
    config: &DumpConfig,
    cancel: CancellationToken,
  ) -> Result<Box<dyn DumpHandle>>;
}

/// An open upstream stream.
pub trait DumpHandle: Send {
  /// Returns the next buffered delivery without blocking.
  fn poll(&mut self) -> PollResult;

  /// Releases the stream's connection. Called exactly once by the session.
  fn close(&mut self);
}

/// Per-split owner of one upstream stream.
pub struct StreamSession {
  split: InputSplit,
  handle: Option<Box<dyn DumpHandle>>,
  state: StreamState,
  fault: Option<String>,
  cancel: CancellationToken,
}

impl std::fmt::Debug for StreamSession {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("StreamSession")
      .field("split", &self.split)
      .field("state", &self.state)
      .field("open", &self.handle.is_some())
      .finish()
  }
}

impl StreamSession {
  /// Opens a session for `split`, bounded by the configured connect timeout.
  ///
  /// # Errors
  ///
  /// [`DumpError::Connection`] if the client fails or the timeout elapses.
  pub async fn open<C>(client: &C, split: InputSplit, config: &DumpConfig) -> Result<Self>
  where
    C: DumpClient + ?Sized,
  {
    let cancel = CancellationToken::new();
    Self::open_with_token(client, split, config, cancel).await
  }

  /// Like [`open`](Self::open) but driven by a caller-supplied token, so that
  /// a job can cancel all of its sessions at once.
  pub async fn open_with_token<C>(
    client: &C,
    split: InputSplit,
    config: &DumpConfig,
    cancel: CancellationToken,
  ) -> Result<Self>
  where
    C: DumpClient + ?Sized,
  {
    let mut session = Self {
      split,
      handle: None,
      state: StreamState::Created,
      fault: None,
      cancel,
    };
    let opened = tokio::time::timeout(
      config.connect_timeout,
      client.open_stream(&session.split, config, session.cancel.clone()),
    )
    .await
    .map_err(|_| {
      DumpError::Connection(format!(
        "timed out after {:?} opening stream for {}",
        config.connect_timeout, session.split
      ))
    })?;
    session.handle = Some(opened?);
    session.state = StreamState::Subscribed;
    debug!(split = %session.split, "stream session subscribed");
    Ok(session)
  }

  /// Wraps an already opened handle.
  pub fn from_handle(split: InputSplit, handle: Box<dyn DumpHandle>) -> Self {
    Self {
      split,
      handle: Some(handle),
      state: StreamState::Subscribed,
      fault: None,
      cancel: CancellationToken::new(),
    }
  }

  /// The split this session streams.
  pub fn split(&self) -> &InputSplit {
    &self.split
  }

  /// Current lifecycle state.
  pub fn state(&self) -> StreamState {
    self.state
  }

  /// True while the upstream handle is held.
  pub fn is_open(&self) -> bool {
    self.handle.is_some()
  }

  /// Token that aborts this session when cancelled.
  pub fn cancel_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  /// Requests cancellation; the next poll reports [`PollResult::Cancelled`].
  pub fn cancel(&self) {
    self.cancel.cancel();
  }

  /// Returns the next delivery without blocking.
  ///
  /// After a terminal result every further poll repeats it.
  pub fn poll(&mut self) -> PollResult {
    match self.state {
      StreamState::Exhausted => return PollResult::Exhausted,
      StreamState::Errored => {
        return PollResult::Errored(self.fault.clone().unwrap_or_default());
      }
      StreamState::Cancelled => return PollResult::Cancelled,
      _ => {}
    }
    if self.cancel.is_cancelled() {
      self.state = StreamState::Cancelled;
      return PollResult::Cancelled;
    }
    let Some(handle) = self.handle.as_mut() else {
      self.state = StreamState::Cancelled;
      return PollResult::Cancelled;
    };

    let result = handle.poll();
    match &result {
      PollResult::Message(_) | PollResult::Empty => self.state = StreamState::Streaming,
      PollResult::Exhausted => {
        self.state = StreamState::Exhausted;
        debug!(split = %self.split, "stream exhausted");
      }
      PollResult::Errored(cause) => {
        self.state = StreamState::Errored;
        self.fault = Some(cause.clone());
        warn!(split = %self.split, cause = %cause, "stream errored");
      }
      PollResult::Cancelled => {
        self.state = StreamState::Cancelled;
        debug!(split = %self.split, "stream cancelled upstream");
      }
    }
    result
  }

  /// Releases the upstream stream. Idempotent.
  ///
  /// Closing a session that has not terminated moves it to
  /// [`StreamState::Cancelled`].
  pub fn close(&mut self) {
    if let Some(mut handle) = self.handle.take() {
      self.cancel.cancel();
      handle.close();
      if !self.state.is_terminal() {
        self.state = StreamState::Cancelled;
      }
      debug!(split = %self.split, state = ?self.state, "stream session closed");
    }
  }
}

impl Drop for StreamSession {
  fn drop(&mut self) {
    self.close();
  }
}

/// Events travelling from a backend's I/O task to a [`FeedHandle`].
#[derive(Debug)]
enum FeedEvent {
  Record(Record),
  End,
  Fault(String),
}

/// Returned by [`FeedSender`] once the consuming side has gone away.
#[derive(Debug, Clone, Copy, Eq, PartialEq, thiserror::Error)]
#[error("feed receiver closed")]
pub struct FeedClosed;

/// Producer half of a [`feed`], owned by a backend I/O task.
#[derive(Debug)]
pub struct FeedSender {
  tx: mpsc::Sender<FeedEvent>,
  cancel: CancellationToken,
}

impl FeedSender {
  /// Buffers a record, waiting while the buffer is full.
  ///
  /// Fails once the handle is closed or the stream cancelled.
  pub async fn send(&self, record: Record) -> std::result::Result<(), FeedClosed> {
    self.deliver(FeedEvent::Record(record)).await
  }

  /// Signals terminal success.
  pub async fn finish(self) -> std::result::Result<(), FeedClosed> {
    self.deliver(FeedEvent::End).await
  }

  /// Signals a terminal fault.
  pub async fn fail(self, cause: impl Into<String>) -> std::result::Result<(), FeedClosed> {
    self.deliver(FeedEvent::Fault(cause.into())).await
  }

  /// Resolves when the stream is cancelled or closed.
  pub async fn cancelled(&self) {
    self.cancel.cancelled().await;
  }

  /// True once the stream is cancelled or the handle dropped.
  pub fn is_closed(&self) -> bool {
    self.cancel.is_cancelled() || self.tx.is_closed()
  }

  async fn deliver(&self, event: FeedEvent) -> std::result::Result<(), FeedClosed> {
    tokio::select! {
      biased;
      _ = self.cancel.cancelled() => Err(FeedClosed),
      sent = self.tx.send(event) => sent.map_err(|_| FeedClosed),
    }
  }
}

/// Consumer half of a [`feed`]; a [`DumpHandle`] over the buffered events.
#[derive(Debug)]
pub struct FeedHandle {
  rx: mpsc::Receiver<FeedEvent>,
  terminal: Option<PollResult>,
  cancel: CancellationToken,
}

impl DumpHandle for FeedHandle {
  fn poll(&mut self) -> PollResult {
    if let Some(terminal) = &self.terminal {
      return terminal.clone();
    }
    let result = match self.rx.try_recv() {
      Ok(FeedEvent::Record(record)) => return PollResult::Message(record),
      Err(TryRecvError::Empty) => return PollResult::Empty,
      Ok(FeedEvent::End) => PollResult::Exhausted,
      Ok(FeedEvent::Fault(cause)) => PollResult::Errored(cause),
      Err(TryRecvError::Disconnected) => {
        if self.cancel.is_cancelled() {
          PollResult::Cancelled
        } else {
          PollResult::Errored("stream closed without end-of-stream marker".to_string())
        }
      }
    };
    self.terminal = Some(result.clone());
    result
  }

  fn close(&mut self) {
    self.rx.close();
    self.cancel.cancel();
  }
}

/// Builds a bounded buffer between a backend I/O task and a session.
///
/// `cancel` should be the token passed to [`DumpClient::open_stream`]; the
/// sender stops accepting events once it fires.
pub fn feed(capacity: usize, cancel: CancellationToken) -> (FeedSender, FeedHandle) {
  let (tx, rx) = mpsc::channel(capacity.max(1));
  (
    FeedSender {
      tx,
      cancel: cancel.clone(),
    },
    FeedHandle {
      rx,
      terminal: None,
      cancel,
    },
  )
}
