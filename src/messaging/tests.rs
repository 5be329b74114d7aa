use super::{CloseReason, Correlator, FilteredEvent, FilteredResponses, Responder};
use crate::session::command::Command;
use crate::topic::MessagePath;
use crate::transport::SessionId;
use crate::utils::error::SessionError;
use tokio::sync::mpsc;

fn sid(id: &str) -> SessionId {
    SessionId::new(id)
}

#[tokio::test]
async fn test_correlator_closes_after_every_recipient_answered() {
    let mut correlator = Correlator::new();
    let (tx, rx) = mpsc::unbounded_channel();
    correlator.open(7, 3, tx);

    assert!(correlator.deliver(7, sid("b"), Ok(2i64.into())));
    assert!(correlator.deliver(7, sid("a"), Err("busy".to_string())));
    assert!(correlator.deliver(7, sid("c"), Ok(3i64.into())));
    assert!(correlator.is_empty());

    let (answers, reason) = FilteredResponses::new(3, rx).collect_all().await;
    assert_eq!(reason, CloseReason::Complete);
    assert_eq!(
        answers,
        vec![
            FilteredEvent::Response {
                session_id: sid("b"),
                value: 2i64.into()
            },
            FilteredEvent::ResponseError {
                session_id: sid("a"),
                message: "busy".to_string()
            },
            FilteredEvent::Response {
                session_id: sid("c"),
                value: 3i64.into()
            },
        ]
    );
}

#[tokio::test]
async fn test_correlator_drops_duplicates_and_late_answers() {
    let mut correlator = Correlator::new();
    let (tx, rx) = mpsc::unbounded_channel();
    correlator.open(1, 2, tx);

    assert!(correlator.deliver(1, sid("a"), Ok("x".into())));
    assert!(!correlator.deliver(1, sid("a"), Ok("again".into())));
    assert!(correlator.deliver(1, sid("b"), Ok("y".into())));
    // stream is retired, anything further is dropped
    assert!(!correlator.deliver(1, sid("c"), Ok("z".into())));

    let mut responses = FilteredResponses::new(2, rx);
    let mut seen = Vec::new();
    while let Some(event) = responses.next_event().await {
        seen.push(event);
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[2], FilteredEvent::Closed(CloseReason::Complete));
    assert_eq!(responses.next_event().await, None);
}

#[tokio::test]
async fn test_zero_matches_close_immediately() {
    let mut correlator = Correlator::new();
    let (tx, rx) = mpsc::unbounded_channel();
    correlator.open(3, 0, tx);
    assert!(correlator.is_empty());

    let responses = FilteredResponses::new(0, rx);
    assert_eq!(responses.matched(), 0);
    let (answers, reason) = responses.collect_all().await;
    assert!(answers.is_empty());
    assert_eq!(reason, CloseReason::Complete);
}

#[tokio::test]
async fn test_retire_all_sends_one_close_per_stream() {
    let mut correlator = Correlator::new();
    let (tx1, rx1) = mpsc::unbounded_channel();
    let (tx2, rx2) = mpsc::unbounded_channel();
    correlator.open(1, 2, tx1);
    correlator.open(2, 1, tx2);
    correlator.deliver(1, sid("a"), Ok(1.5.into()));

    correlator.retire_all(CloseReason::SessionLost);
    assert_eq!(correlator.len(), 0);
    correlator.retire_all(CloseReason::SessionClosed);

    let (answers, reason) = FilteredResponses::new(2, rx1).collect_all().await;
    assert_eq!(answers.len(), 1);
    assert_eq!(reason, CloseReason::SessionLost);

    let (answers, reason) = FilteredResponses::new(1, rx2).collect_all().await;
    assert!(answers.is_empty());
    assert_eq!(reason, CloseReason::SessionLost);
}

#[tokio::test]
async fn test_stream_without_close_event_reports_session_closed() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(tx);
    let mut responses = FilteredResponses::new(1, rx);
    assert_eq!(
        responses.next_event().await,
        Some(FilteredEvent::Closed(CloseReason::SessionClosed))
    );
    assert_eq!(responses.next_event().await, None);
}

fn echo() -> MessagePath {
    MessagePath::parse(">echo").unwrap()
}

#[tokio::test]
async fn test_dropped_responder_answers_with_error() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let responder = Responder::new(42, echo(), tx.downgrade());
    drop(responder);

    match rx.recv().await {
        Some(Command::Respond { request_id, result }) => {
            assert_eq!(request_id, 42);
            assert!(result.is_err());
        }
        _ => panic!("expected an error response"),
    }
}

#[tokio::test]
async fn test_responder_answers_once() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let responder = Responder::new(5, echo(), tx.downgrade());
    responder.respond(10i64).unwrap();

    match rx.recv().await {
        Some(Command::Respond { request_id, result }) => {
            assert_eq!(request_id, 5);
            assert_eq!(result, Ok(10i64.into()));
        }
        _ => panic!("expected a response"),
    }
    // the responder was consumed, so nothing else follows
    drop(tx);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_responder_does_not_keep_session_alive() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
    let responder = Responder::new(3, echo(), tx.downgrade());
    drop(tx);

    // only the responder is left, and it holds no sender
    assert!(rx.recv().await.is_none());
    assert_eq!(responder.respond(1i64), Err(SessionError::SessionNotConnected));
}

#[tokio::test]
async fn test_responder_refuses_non_finite_values() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let responder = Responder::new(8, echo(), tx.downgrade());
    assert!(matches!(
        responder.respond(f64::NAN),
        Err(SessionError::InvalidValue { .. })
    ));

    // the refused responder still answers, with an error
    match rx.recv().await {
        Some(Command::Respond { request_id, result }) => {
            assert_eq!(request_id, 8);
            assert!(result.is_err());
        }
        _ => panic!("expected an error response"),
    }
}
