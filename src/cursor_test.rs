//! # Record Cursor Test Suite
//!
//! Drives [`RecordCursor`] over scripted upstream handles to pin down its
//! termination contract: sticky exhaustion, sticky failure, cancellation within
//! a backoff step and a single upstream close.

use crate::config::PollBackoff;
use crate::cursor::{CursorStats, RecordCursor};
use crate::error::DumpError;
use crate::session::{PollResult, StreamSession, StreamState};
use crate::session_test::{ScriptedHandle, record, split};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn cursor(script: Vec<PollResult>) -> (RecordCursor, Arc<AtomicUsize>) {
  let handle = ScriptedHandle::new(script);
  let closes = handle.closes.clone();
  let session = StreamSession::from_handle(split(), Box::new(handle));
  let backoff = PollBackoff::new(Duration::from_millis(1), Duration::from_millis(4));
  (RecordCursor::with_backoff(session, backoff), closes)
}

#[tokio::test]
async fn test_advance_skips_empty_polls_and_exhausts() {
  let (mut cursor, _) = cursor(vec![
    PollResult::Message(record("k1")),
    PollResult::Empty,
    PollResult::Empty,
    PollResult::Message(record("k2")),
    PollResult::Exhausted,
  ]);

  assert!(cursor.advance().await.unwrap());
  assert_eq!(cursor.current(), Some(&record("k1")));
  assert!(cursor.advance().await.unwrap());
  assert_eq!(cursor.current(), Some(&record("k2")));
  assert!(!cursor.advance().await.unwrap());
  assert_eq!(cursor.current(), None);
  assert_eq!(cursor.state(), StreamState::Exhausted);
}

#[tokio::test]
async fn test_exhaustion_is_sticky() {
  let (mut cursor, _) = cursor(vec![
    PollResult::Exhausted,
    PollResult::Message(record("ghost")),
  ]);
  for _ in 0..4 {
    assert!(!cursor.advance().await.unwrap());
  }
  assert_eq!(cursor.stats().records, 0);
}

#[tokio::test]
async fn test_failure_is_sticky() {
  let (mut cursor, _) = cursor(vec![
    PollResult::Message(record("k1")),
    PollResult::Errored("connection reset".to_string()),
    PollResult::Message(record("k2")),
  ]);
  assert!(cursor.advance().await.unwrap());

  let expected = DumpError::Protocol("connection reset".to_string());
  assert_eq!(cursor.advance().await.unwrap_err(), expected);
  assert_eq!(cursor.advance().await.unwrap_err(), expected);
  assert_eq!(cursor.current(), None);
  assert_eq!(cursor.state(), StreamState::Errored);
}

#[tokio::test]
async fn test_upstream_cancel_surfaces_as_cancelled() {
  let (mut cursor, _) = cursor(vec![PollResult::Cancelled]);
  assert_eq!(cursor.advance().await.unwrap_err(), DumpError::Cancelled);
  assert_eq!(cursor.advance().await.unwrap_err(), DumpError::Cancelled);
}

#[tokio::test]
async fn test_cancel_interrupts_waiting_advance() {
  // The script never terminates, so only cancellation can end the wait.
  let (mut cursor, _) = cursor(vec![]);
  let token = cursor.cancel_token();
  let advancing = tokio::spawn(async move {
    let result = cursor.advance().await;
    (result, cursor)
  });
  tokio::time::sleep(Duration::from_millis(10)).await;
  token.cancel();

  let (result, cursor) = tokio::time::timeout(Duration::from_secs(1), advancing)
    .await
    .unwrap()
    .unwrap();
  assert_eq!(result.unwrap_err(), DumpError::Cancelled);
  assert_eq!(cursor.state(), StreamState::Cancelled);
  assert!(cursor.stats().empty_polls > 0);
}

#[tokio::test]
async fn test_progress_reports_zero_then_one() {
  let (mut cursor, _) = cursor(vec![PollResult::Message(record("k1")), PollResult::Exhausted]);
  assert_eq!(cursor.progress(), 0.0);
  cursor.advance().await.unwrap();
  assert_eq!(cursor.progress(), 0.0);
  cursor.advance().await.unwrap();
  assert_eq!(cursor.progress(), 1.0);
}

#[tokio::test]
async fn test_failure_without_messages_is_sticky() {
  let (mut cursor, _) = cursor(vec![PollResult::Errored("boom".to_string())]);
  let expected = DumpError::Protocol("boom".to_string());
  assert_eq!(cursor.advance().await.unwrap_err(), expected);
  assert_eq!(cursor.advance().await.unwrap_err(), expected);
  assert_eq!(cursor.current(), None);
  assert_eq!(cursor.progress(), 0.0);
}

#[tokio::test]
async fn test_close_releases_upstream_once() {
  let (mut cursor, closes) = cursor(vec![PollResult::Exhausted]);
  cursor.advance().await.unwrap();
  cursor.close();
  cursor.close();
  drop(cursor);
  assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_without_advancing() {
  let (mut cursor, closes) = cursor(vec![PollResult::Message(record("k1"))]);
  cursor.close();
  assert_eq!(closes.load(Ordering::SeqCst), 1);
  assert_eq!(cursor.state(), StreamState::Cancelled);
  assert_eq!(cursor.advance().await.unwrap_err(), DumpError::Cancelled);
}

#[tokio::test]
async fn test_take_current_moves_record_out() {
  let (mut cursor, _) = cursor(vec![PollResult::Message(record("k1"))]);
  cursor.advance().await.unwrap();
  assert_eq!(cursor.take_current(), Some(record("k1")));
  assert_eq!(cursor.current(), None);
}

#[tokio::test]
async fn test_stats_tally_delivered_bytes() {
  let (mut cursor, _) = cursor(vec![
    PollResult::Empty,
    PollResult::Message(record("ab")),
    PollResult::Message(record("cde")),
    PollResult::Exhausted,
  ]);
  while cursor.advance().await.unwrap() {}
  assert_eq!(
    cursor.stats(),
    CursorStats {
      records: 2,
      key_bytes: 5,
      value_bytes: 10,
      empty_polls: 1,
    }
  );
}

#[tokio::test]
async fn test_into_stream_yields_records_then_ends() {
  let (cursor, closes) = cursor(vec![
    PollResult::Message(record("k1")),
    PollResult::Empty,
    PollResult::Message(record("k2")),
    PollResult::Exhausted,
  ]);
  let records: Vec<_> = cursor.into_stream().collect().await;
  assert_eq!(records, vec![Ok(record("k1")), Ok(record("k2"))]);
  assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_into_stream_stops_after_first_error() {
  let (cursor, _) = cursor(vec![
    PollResult::Message(record("k1")),
    PollResult::Errored("bad frame".to_string()),
  ]);
  let items: Vec<_> = cursor.into_stream().collect().await;
  assert_eq!(
    items,
    vec![
      Ok(record("k1")),
      Err(DumpError::Protocol("bad frame".to_string())),
    ]
  );
}
