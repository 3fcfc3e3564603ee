use crate::config::DumpConfig;
use crate::error::{DumpError, Result};
use crate::session::{
  DumpClient, DumpHandle, PollResult, Record, StreamSession, StreamState, feed,
};
use crate::split::{InputSplit, SplitDescriptor};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Handle that replays a fixed script of poll results, then reports `Empty`.
pub(crate) struct ScriptedHandle {
  script: VecDeque<PollResult>,
  pub(crate) polls: Arc<AtomicUsize>,
  pub(crate) closes: Arc<AtomicUsize>,
}

impl ScriptedHandle {
  pub(crate) fn new(script: impl IntoIterator<Item = PollResult>) -> Self {
    Self {
      script: script.into_iter().collect(),
      polls: Arc::new(AtomicUsize::new(0)),
      closes: Arc::new(AtomicUsize::new(0)),
    }
  }
}

impl DumpHandle for ScriptedHandle {
  fn poll(&mut self) -> PollResult {
    self.polls.fetch_add(1, Ordering::SeqCst);
    self.script.pop_front().unwrap_or(PollResult::Empty)
  }

  fn close(&mut self) {
    self.closes.fetch_add(1, Ordering::SeqCst);
  }
}

pub(crate) fn split() -> InputSplit {
  InputSplit::from(SplitDescriptor::new(vec![0, 1, 2]).unwrap())
}

pub(crate) fn record(key: &'static str) -> Record {
  Record::new(key, "value")
}

fn scripted(script: Vec<PollResult>) -> (StreamSession, Arc<AtomicUsize>, Arc<AtomicUsize>) {
  let handle = ScriptedHandle::new(script);
  let polls = handle.polls.clone();
  let closes = handle.closes.clone();
  (
    StreamSession::from_handle(split(), Box::new(handle)),
    polls,
    closes,
  )
}

#[test]
fn test_state_transitions_to_exhausted() {
  let (mut session, _, _) = scripted(vec![
    PollResult::Empty,
    PollResult::Message(record("a")),
    PollResult::Exhausted,
  ]);
  assert_eq!(session.state(), StreamState::Subscribed);
  assert_eq!(session.poll(), PollResult::Empty);
  assert_eq!(session.state(), StreamState::Streaming);
  assert_eq!(session.poll(), PollResult::Message(record("a")));
  assert_eq!(session.poll(), PollResult::Exhausted);
  assert_eq!(session.state(), StreamState::Exhausted);
}

#[test]
fn test_terminal_result_is_replayed_without_polling_upstream() {
  let (mut session, polls, _) = scripted(vec![
    PollResult::Errored("partition 2 moved".to_string()),
    PollResult::Message(record("late")),
  ]);
  assert_eq!(
    session.poll(),
    PollResult::Errored("partition 2 moved".to_string())
  );
  for _ in 0..3 {
    assert_eq!(
      session.poll(),
      PollResult::Errored("partition 2 moved".to_string())
    );
  }
  assert_eq!(polls.load(Ordering::SeqCst), 1);
  assert_eq!(session.state(), StreamState::Errored);
}

#[test]
fn test_cancel_is_observed_on_next_poll() {
  let (mut session, polls, _) = scripted(vec![PollResult::Message(record("a"))]);
  session.cancel();
  assert_eq!(session.poll(), PollResult::Cancelled);
  assert_eq!(session.state(), StreamState::Cancelled);
  assert_eq!(polls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_close_is_idempotent() {
  let (mut session, _, closes) = scripted(vec![PollResult::Empty]);
  session.poll();
  session.close();
  session.close();
  drop(session);
  assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_close_before_termination_cancels() {
  let (mut session, _, _) = scripted(vec![]);
  let token = session.cancel_token();
  session.close();
  assert!(!session.is_open());
  assert!(token.is_cancelled());
  assert_eq!(session.state(), StreamState::Cancelled);
  assert_eq!(session.poll(), PollResult::Cancelled);
}

#[test]
fn test_close_after_exhaustion_keeps_state() {
  let (mut session, _, closes) = scripted(vec![PollResult::Exhausted]);
  session.poll();
  session.close();
  assert_eq!(session.state(), StreamState::Exhausted);
  assert_eq!(session.poll(), PollResult::Exhausted);
  assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_drop_closes_upstream() {
  let (session, _, closes) = scripted(vec![]);
  drop(session);
  assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_feed_delivers_in_order_then_exhausts() {
  let (tx, mut handle) = feed(4, CancellationToken::new());
  assert_eq!(handle.poll(), PollResult::Empty);

  tx.send(record("a")).await.unwrap();
  tx.send(record("b")).await.unwrap();
  tx.finish().await.unwrap();

  assert_eq!(handle.poll(), PollResult::Message(record("a")));
  assert_eq!(handle.poll(), PollResult::Message(record("b")));
  assert_eq!(handle.poll(), PollResult::Exhausted);
  assert_eq!(handle.poll(), PollResult::Exhausted);
}

#[test]
fn test_feed_send_waits_while_buffer_is_full() {
  let (tx, mut handle) = feed(1, CancellationToken::new());
  let mut first = tokio_test::task::spawn(tx.send(record("a")));
  tokio_test::assert_ready_ok!(first.poll());
  drop(first);

  let mut second = tokio_test::task::spawn(tx.send(record("b")));
  tokio_test::assert_pending!(second.poll());
  assert_eq!(handle.poll(), PollResult::Message(record("a")));
  assert!(second.is_woken());
  tokio_test::assert_ready_ok!(second.poll());
}

#[tokio::test]
async fn test_feed_fault_is_sticky() {
  let (tx, mut handle) = feed(4, CancellationToken::new());
  tx.fail("vbucket not my vbucket").await.unwrap();
  for _ in 0..2 {
    assert_eq!(
      handle.poll(),
      PollResult::Errored("vbucket not my vbucket".to_string())
    );
  }
}

#[tokio::test]
async fn test_feed_dropped_sender_is_an_error() {
  let (tx, mut handle) = feed(1, CancellationToken::new());
  drop(tx);
  assert!(matches!(handle.poll(), PollResult::Errored(_)));
}

#[tokio::test]
async fn test_feed_sender_stops_after_cancel() {
  let cancel = CancellationToken::new();
  let (tx, mut handle) = feed(1, cancel.clone());
  cancel.cancel();
  assert!(tx.is_closed());
  assert!(tx.send(record("a")).await.is_err());
  drop(tx);
  assert_eq!(handle.poll(), PollResult::Cancelled);
}

#[tokio::test]
async fn test_feed_close_unblocks_sender() {
  let (tx, mut handle) = feed(1, CancellationToken::new());
  tx.send(record("a")).await.unwrap();
  let blocked = tokio::spawn(async move { tx.send(record("b")).await });
  handle.close();
  assert!(blocked.await.unwrap().is_err());
}

struct StalledClient;

#[async_trait]
impl DumpClient for StalledClient {
  async fn open_stream(
    &self,
    _split: &InputSplit,
    _config: &DumpConfig,
    _cancel: CancellationToken,
  ) -> Result<Box<dyn DumpHandle>> {
    std::future::pending().await
  }
}

#[tokio::test]
async fn test_open_times_out_as_connection_error() {
  let config = DumpConfig::new(["http://localhost:8091/pools"])
    .with_connect_timeout(Duration::from_millis(20));
  let err = StreamSession::open(&StalledClient, split(), &config)
    .await
    .unwrap_err();
  assert!(matches!(err, DumpError::Connection(_)));
}

struct ScriptClient(Arc<AtomicUsize>);

#[async_trait]
impl DumpClient for ScriptClient {
  async fn open_stream(
    &self,
    _split: &InputSplit,
    _config: &DumpConfig,
    _cancel: CancellationToken,
  ) -> Result<Box<dyn DumpHandle>> {
    let mut handle = ScriptedHandle::new(vec![PollResult::Exhausted]);
    handle.closes = self.0.clone();
    Ok(Box::new(handle))
  }
}

#[tokio::test]
async fn test_open_subscribes_and_shares_token() {
  let closes = Arc::new(AtomicUsize::new(0));
  let config = DumpConfig::new(["http://localhost:8091/pools"]);
  let token = CancellationToken::new();
  let mut session = StreamSession::open_with_token(
    &ScriptClient(closes.clone()),
    split(),
    &config,
    token.child_token(),
  )
  .await
  .unwrap();
  assert_eq!(session.state(), StreamState::Subscribed);
  assert!(session.is_open());

  token.cancel();
  assert_eq!(session.poll(), PollResult::Cancelled);
  session.close();
  assert_eq!(closes.load(Ordering::SeqCst), 1);
}
