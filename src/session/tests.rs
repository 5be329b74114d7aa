use super::{RecoveryPolicy, Session, SessionEvent, SessionOptions, SessionState};
use crate::broker::{Broker, LoopbackConnector, SharedBroker, lock, shared};
use crate::messaging::{CloseReason, FilteredEvent};
use crate::reconnect::{FixedDelay, ReconnectPolicy};
use crate::topic::{AddTopicResult, TopicSpecification, TopicType, TopicValue};
use crate::transport::{Credentials, SessionId};
use crate::utils::error::SessionError;
use futures_util::FutureExt;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(5);

async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}

fn quick_reconnect() -> ReconnectPolicy {
    ReconnectPolicy::new(FixedDelay(Duration::from_millis(20)), Duration::from_secs(5))
}

fn options() -> SessionOptions {
    SessionOptions::default().reconnect(quick_reconnect())
}

async fn try_connect(
    broker: &SharedBroker,
    principal: &str,
    password: &str,
    options: SessionOptions,
) -> Result<Session, SessionError> {
    let connector = Arc::new(LoopbackConnector::new(broker.clone()));
    Session::connect_with(
        connector,
        "loopback",
        Credentials::new(principal, password),
        options,
    )
    .await
}

async fn connect(broker: &SharedBroker, principal: &str, options: SessionOptions) -> Session {
    try_connect(broker, principal, "secret", options)
        .await
        .unwrap()
}

async fn wait_for_sessions(broker: &SharedBroker, count: usize) {
    within(async {
        while lock(broker).session_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
}

async fn next_event(events: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    within(events.recv()).await.unwrap()
}

#[tokio::test]
async fn test_double_topic_scenario() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    assert_eq!(session.state(), SessionState::Connected);

    assert_eq!(
        session.add_topic("random", TopicType::Double).await,
        Ok(AddTopicResult::Created)
    );
    for value in [0.25, 0.5, 0.75] {
        session.update("random", value).await.unwrap();
    }
    assert_eq!(
        session.fetch("random").await,
        Ok(Some(TopicValue::Double(0.75)))
    );
    assert_eq!(
        session.add_topic("random", TopicType::Double).await,
        Ok(AddTopicResult::Exists)
    );
    assert_eq!(
        session.add_topic("random", TopicType::String).await,
        Err(SessionError::TopicAlreadyExists("random".to_string()))
    );

    session.remove_topic("random").await.unwrap();
    assert_eq!(
        session.update("random", 1.0).await,
        Err(SessionError::TopicNotFound("random".to_string()))
    );
    assert_eq!(
        session.remove_topic("random").await,
        Err(SessionError::TopicNotFound("random".to_string()))
    );

    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_connect_to_unreachable_broker_fails() {
    let broker = shared(Broker::new());
    lock(&broker).set_reachable(false);
    let result = try_connect(&broker, "control", "secret", options()).await;
    assert!(matches!(result, Err(SessionError::Connection { .. })));
}

#[tokio::test]
async fn test_connect_with_bad_credentials_fails() {
    let broker = shared(Broker::new().with_user("control", "password"));
    let result = try_connect(&broker, "control", "nope", options()).await;
    assert_eq!(
        result.err(),
        Some(SessionError::Connection {
            message: "authentication failed".to_string()
        })
    );
    assert!(try_connect(&broker, "control", "password", options()).await.is_ok());
}

#[tokio::test]
async fn test_invalid_paths_fail_locally() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;

    for path in ["", "a//b", "/a", ">a"] {
        assert!(
            matches!(
                session.add_topic(path, TopicType::Int64).await,
                Err(SessionError::InvalidPath { .. })
            ),
            "accepted {path:?}"
        );
    }
    assert!(matches!(
        session.add_request_handler("").await,
        Err(SessionError::InvalidPath { .. })
    ));
    assert_eq!(lock(&broker).topic_count(), 0);
}

#[tokio::test]
async fn test_type_mismatch_leaves_value_untouched() {
    let broker = shared(Broker::new());
    let owner = connect(&broker, "control", options()).await;
    let other = connect(&broker, "other", options()).await;

    owner.add_topic("t", TopicType::Double).await.unwrap();
    owner.update("t", 1.5).await.unwrap();

    // checked locally by the owner
    assert_eq!(
        owner.update("t", "text").await,
        Err(SessionError::TypeMismatch {
            path: "t".to_string(),
            expected: TopicType::Double,
            actual: TopicType::String,
        })
    );
    // checked by the broker for everyone else
    assert_eq!(
        other.update("t", 7i64).await,
        Err(SessionError::TypeMismatch {
            path: "t".to_string(),
            expected: TopicType::Double,
            actual: TopicType::Int64,
        })
    );
    assert_eq!(other.fetch("t").await, Ok(Some(TopicValue::Double(1.5))));
}

#[tokio::test]
async fn test_updates_reach_subscribers_in_order() {
    let broker = shared(Broker::new());
    let owner = connect(&broker, "control", options()).await;
    let watcher = connect(&broker, "watcher", options()).await;

    owner.add_topic("counter", TopicType::Int64).await.unwrap();
    let mut stream = watcher.subscribe("counter").await.unwrap();

    let updates = (0..100i64).map(|i| owner.update("counter", i));
    for result in futures_util::future::join_all(updates).await {
        result.unwrap();
    }

    let mut previous = None;
    for expected in 0..100i64 {
        let event = within(stream.recv()).await.unwrap();
        assert_eq!(event.new_value, TopicValue::Int64(expected));
        assert_eq!(event.old_value, previous);
        previous = Some(event.new_value);
    }

    watcher.unsubscribe("counter").await.unwrap();
    assert!(within(stream.recv()).await.is_none());
}

#[tokio::test]
async fn test_subscribe_delivers_current_value_first() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    session.add_topic("config", TopicType::Json).await.unwrap();
    session
        .update("config", serde_json::json!({"level": 3}))
        .await
        .unwrap();

    let mut stream = session.subscribe("config").await.unwrap();
    let event = within(stream.recv()).await.unwrap();
    assert_eq!(event.path.as_str(), "config");
    assert_eq!(event.old_value, None);
    assert_eq!(
        event.new_value,
        TopicValue::Json(serde_json::json!({"level": 3}))
    );
}

async fn spawn_worker(broker: &SharedBroker, principal: &str, answer: i64) -> Session {
    let worker = connect(broker, principal, options()).await;
    let mut requests = worker.add_request_handler(">jobs").await.unwrap();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            if answer < 0 {
                request.reject("refused").unwrap();
            } else {
                request.respond(answer).unwrap();
            }
        }
    });
    worker
}

#[tokio::test]
async fn test_filtered_request_collects_one_answer_per_match() {
    let broker = shared(Broker::new());
    let requester = connect(&broker, "control", options()).await;
    let mut workers = Vec::new();
    for answer in [1, 2, -1] {
        workers.push(spawn_worker(&broker, "worker", answer).await);
    }
    let _bystander = spawn_worker(&broker, "bystander", 99).await;

    let responses = requester
        .send_to_filter("$Principal EQ 'worker'", ">jobs", "ping")
        .await
        .unwrap();
    assert_eq!(responses.matched(), 3);

    let (answers, reason) = within(responses.collect_all()).await;
    assert_eq!(reason, CloseReason::Complete);
    assert_eq!(answers.len(), 3);

    let mut values = Vec::new();
    let mut responders = HashSet::new();
    for answer in answers {
        match answer {
            FilteredEvent::Response { session_id, value } => {
                values.push(value.as_i64().unwrap());
                responders.insert(session_id);
            }
            FilteredEvent::ResponseError {
                session_id,
                message,
            } => {
                assert_eq!(message, "refused");
                responders.insert(session_id);
            }
            FilteredEvent::Closed(_) => unreachable!(),
        }
    }
    values.sort();
    assert_eq!(values, vec![1, 2]);
    let expected: HashSet<_> = workers.iter().map(Session::id).collect();
    assert_eq!(responders, expected);
}

#[tokio::test]
async fn test_filtered_request_with_no_match_closes_at_once() {
    let broker = shared(Broker::new());
    let requester = connect(&broker, "control", options()).await;
    let responses = requester
        .send_to_filter("$Principal EQ 'nobody'", ">jobs", "ping")
        .await
        .unwrap();
    assert_eq!(responses.matched(), 0);
    let (answers, reason) = within(responses.collect_all()).await;
    assert!(answers.is_empty());
    assert_eq!(reason, CloseReason::Complete);
}

#[tokio::test]
async fn test_invalid_filter_is_reported() {
    let broker = shared(Broker::new());
    let requester = connect(&broker, "control", options()).await;
    assert!(matches!(
        requester.send_to_filter("$Principal ~ 'x'", ">jobs", "ping").await,
        Err(SessionError::InvalidFilter { .. })
    ));
    assert!(matches!(
        requester.send_to_filter("  ", ">jobs", "ping").await,
        Err(SessionError::InvalidFilter { .. })
    ));
}

#[tokio::test]
async fn test_dropped_request_is_answered_with_error() {
    let broker = shared(Broker::new());
    let requester = connect(&broker, "control", options()).await;
    let worker = connect(&broker, "worker", options()).await;
    let mut requests = worker.add_request_handler(">jobs").await.unwrap();
    tokio::spawn(async move {
        while let Some(request) = requests.recv().await {
            drop(request);
        }
    });

    let responses = requester
        .send_to_filter("all", ">jobs", "ping")
        .await
        .unwrap();
    let (answers, reason) = within(responses.collect_all()).await;
    assert_eq!(reason, CloseReason::Complete);
    assert!(matches!(
        answers.as_slice(),
        [FilteredEvent::ResponseError { .. }]
    ));
}

#[tokio::test]
async fn test_send_to_session_round_trip() {
    let broker = shared(Broker::new());
    let requester = connect(&broker, "control", options()).await;
    let worker = spawn_worker(&broker, "worker", 42).await;

    assert_eq!(
        within(requester.send_to_session(&worker.id(), ">jobs", "ping")).await,
        Ok(TopicValue::Int64(42))
    );
    assert!(matches!(
        requester.send_to_session(&worker.id(), ">other", "ping").await,
        Err(SessionError::RequestFailed(_))
    ));
    worker.close().await;
    assert!(matches!(
        requester.send_to_session(&worker.id(), ">jobs", "ping").await,
        Err(SessionError::SessionNotFound(_))
    ));
}

#[tokio::test]
async fn test_reconnects_transparently_after_connection_loss() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    let id = session.id();
    session.add_topic("t", TopicType::Double).await.unwrap();
    let mut stream = session.subscribe("t").await.unwrap();
    let mut events = session.events();

    lock(&broker).drop_connections();
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnect);
    assert_eq!(next_event(&mut events).await, SessionEvent::Reconnect);
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.reconnect_attempts(), 0);
    // the broker kept the session
    assert_eq!(session.id(), id);

    session.update("t", 2.0).await.unwrap();
    assert_eq!(
        within(stream.recv()).await.map(|e| e.new_value),
        Some(TopicValue::Double(2.0))
    );
    assert!(matches!(
        session.update("t", 2i64).await,
        Err(SessionError::TypeMismatch { .. })
    ));
}

#[tokio::test]
async fn test_attempts_count_up_and_reset() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    let mut events = session.events();

    {
        let mut broker = lock(&broker);
        broker.set_reachable(false);
        broker.drop_connections();
    }
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnect);
    within(async {
        while session.reconnect_attempts() < 3 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert_eq!(session.state(), SessionState::Recovering);

    lock(&broker).set_reachable(true);
    assert_eq!(next_event(&mut events).await, SessionEvent::Reconnect);
    assert_eq!(session.reconnect_attempts(), 0);
}

#[tokio::test]
async fn test_operations_queue_while_recovering() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    session.add_topic("t", TopicType::Int64).await.unwrap();

    {
        let mut broker = lock(&broker);
        broker.set_reachable(false);
        broker.drop_connections();
    }
    within(session.wait_for_state(SessionState::Recovering))
        .await
        .unwrap();

    let queued = {
        let session = session.clone();
        tokio::spawn(async move {
            session.update("t", 1i64).await?;
            session.update("t", 2i64).await
        })
    };
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!queued.is_finished());

    lock(&broker).set_reachable(true);
    within(queued).await.unwrap().unwrap();
    assert_eq!(session.fetch("t").await, Ok(Some(TopicValue::Int64(2))));
}

#[tokio::test]
async fn test_operations_fail_fast_while_recovering() {
    let broker = shared(Broker::new());
    let session = connect(
        &broker,
        "control",
        options().recovery(RecoveryPolicy::FailFast),
    )
    .await;
    session.add_topic("t", TopicType::Int64).await.unwrap();

    {
        let mut broker = lock(&broker);
        broker.set_reachable(false);
        broker.drop_connections();
    }
    within(session.wait_for_state(SessionState::Recovering))
        .await
        .unwrap();
    assert_eq!(
        session.update("t", 1i64).await,
        Err(SessionError::SessionNotConnected)
    );
    // still checked locally first
    assert!(matches!(
        session.update("t", "x").await,
        Err(SessionError::TypeMismatch { .. })
    ));

    lock(&broker).set_reachable(true);
    within(session.wait_for_state(SessionState::Connected))
        .await
        .unwrap();
    session.update("t", 1i64).await.unwrap();
}

#[tokio::test]
async fn test_recovery_timeout_closes_session() {
    let broker = shared(Broker::new());
    let policy = ReconnectPolicy::new(
        FixedDelay(Duration::from_millis(10)),
        Duration::from_millis(150),
    );
    let session = connect(&broker, "control", options().reconnect(policy)).await;
    session.add_topic("t", TopicType::Int64).await.unwrap();
    let mut events = session.events();

    {
        let mut broker = lock(&broker);
        broker.set_reachable(false);
        broker.drop_connections();
    }
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnect);

    assert_eq!(
        within(session.update("t", 1i64)).await,
        Err(SessionError::Timeout)
    );
    assert_eq!(next_event(&mut events).await, SessionEvent::Close);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(
        session.fetch("t").await,
        Err(SessionError::SessionNotConnected)
    );
}

#[tokio::test]
async fn test_disabled_reconnect_closes_on_first_loss() {
    let broker = shared(Broker::new());
    let session = connect(
        &broker,
        "control",
        options().reconnect(ReconnectPolicy::disabled()),
    )
    .await;
    lock(&broker).drop_connections();
    within(session.wait_for_state(SessionState::Closed))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_broker_restart_replays_registrations() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    let worker = connect(&broker, "worker", options()).await;
    let old_id = session.id();

    session.add_topic("t", TopicType::String).await.unwrap();
    let mut stream = session.subscribe("t").await.unwrap();
    let mut requests = session.add_request_handler(">ping").await.unwrap();

    // a filtered request the worker never answers
    let _held = worker.add_request_handler(">slow").await.unwrap();
    let pending = session
        .send_to_filter("$Principal EQ 'worker'", ">slow", "x")
        .await
        .unwrap();
    assert_eq!(pending.matched(), 1);

    let mut events = session.events();
    lock(&broker).restart();
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnect);
    assert_eq!(next_event(&mut events).await, SessionEvent::Reconnect);
    assert_ne!(session.id(), old_id);

    let (answers, reason) = within(pending.collect_all()).await;
    assert!(answers.is_empty());
    assert_eq!(reason, CloseReason::SessionLost);

    // a round trip after the replay proves the replay was processed
    assert_eq!(session.fetch("t").await, Ok(None));
    assert_eq!(
        lock(&broker).topic("t").map(|t| t.topic_type),
        Some(TopicType::String)
    );

    within(worker.wait_for_state(SessionState::Connected))
        .await
        .unwrap();
    worker.update("t", "after restart").await.unwrap();
    assert_eq!(
        within(stream.recv()).await.map(|e| e.new_value),
        Some(TopicValue::String("after restart".to_string()))
    );

    let reply = {
        let worker = worker.clone();
        let target = session.id();
        tokio::spawn(async move { worker.send_to_session(&target, ">ping", "hello").await })
    };
    let request = within(requests.recv()).await.unwrap();
    assert_eq!(request.payload, TopicValue::from("hello"));
    request.respond("pong").unwrap();
    assert_eq!(
        within(reply).await.unwrap(),
        Ok(TopicValue::String("pong".to_string()))
    );
}

#[tokio::test]
async fn test_close_is_idempotent_and_final() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    let mut events = session.events();

    session.close().await;
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(next_event(&mut events).await, SessionEvent::Close);
    assert_eq!(
        session.add_topic("t", TopicType::Int64).await,
        Err(SessionError::SessionNotConnected)
    );
    assert_eq!(
        session.wait_for_state(SessionState::Connected).await,
        Err(SessionError::SessionNotConnected)
    );
    wait_for_sessions(&broker, 0).await;
}

#[tokio::test]
async fn test_close_while_recovering_fails_queued_operations() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    session.add_topic("t", TopicType::Int64).await.unwrap();

    {
        let mut broker = lock(&broker);
        broker.set_reachable(false);
        broker.drop_connections();
    }
    within(session.wait_for_state(SessionState::Recovering))
        .await
        .unwrap();

    let queued = {
        let session = session.clone();
        tokio::spawn(async move { session.update("t", 1i64).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    session.close().await;

    assert_eq!(
        within(queued).await.unwrap(),
        Err(SessionError::SessionNotConnected)
    );
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_close_ends_open_filtered_streams() {
    let broker = shared(Broker::new());
    let requester = connect(&broker, "control", options()).await;
    let worker = connect(&broker, "worker", options()).await;
    let _held = worker.add_request_handler(">slow").await.unwrap();

    let pending = requester
        .send_to_filter("all", ">slow", "x")
        .await
        .unwrap();
    requester.close().await;

    let (answers, reason) = within(pending.collect_all()).await;
    assert!(answers.is_empty());
    assert_eq!(reason, CloseReason::SessionClosed);
}

#[tokio::test]
async fn test_cancelled_update_does_not_break_ordering() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    session.add_topic("t", TopicType::Int64).await.unwrap();

    // dropped after the first poll: it may or may not have been applied
    assert!(session.update("t", 1i64).now_or_never().is_none());
    session.update("t", 2i64).await.unwrap();
    assert_eq!(session.fetch("t").await, Ok(Some(TopicValue::Int64(2))));
}

#[tokio::test]
async fn test_dropping_every_handle_closes_the_session() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    let clone = session.clone();
    assert_eq!(lock(&broker).session_count(), 1);

    drop(session);
    drop(clone);
    wait_for_sessions(&broker, 0).await;
}

#[tokio::test]
async fn test_session_is_connecting_until_handshake() {
    let broker = shared(Broker::new());
    let connector = Arc::new(LoopbackConnector::new(broker.clone()));
    let session = Session::start(
        connector,
        "loopback",
        Credentials::new("control", "secret"),
        options(),
    );
    assert_eq!(session.state(), SessionState::Connecting);
    assert_eq!(session.id(), SessionId::default());

    // issued before the handshake, sent once it completes
    assert_eq!(
        within(session.add_topic("t", TopicType::Int64)).await,
        Ok(AddTopicResult::Created)
    );
    assert_eq!(session.state(), SessionState::Connected);
    assert_ne!(session.id(), SessionId::default());
}

#[tokio::test]
async fn test_failed_start_closes_session() {
    let broker = shared(Broker::new());
    lock(&broker).set_reachable(false);
    let connector = Arc::new(LoopbackConnector::new(broker.clone()));
    let session = Session::start(
        connector,
        "loopback",
        Credentials::new("control", "secret"),
        options(),
    );
    let waiting = {
        let session = session.clone();
        tokio::spawn(async move { session.fetch("t").await })
    };

    within(session.wait_for_state(SessionState::Closed))
        .await
        .unwrap();
    assert!(matches!(
        within(waiting).await.unwrap(),
        Err(SessionError::Connection { .. } | SessionError::SessionNotConnected)
    ));
}

#[tokio::test]
async fn test_recovery_gives_up_on_time_despite_long_delay() {
    let broker = shared(Broker::new());
    let policy = ReconnectPolicy::new(
        FixedDelay(Duration::from_secs(4)),
        Duration::from_millis(300),
    );
    let session = connect(&broker, "control", options().reconnect(policy)).await;
    let mut events = session.events();

    let lost = Instant::now();
    {
        let mut broker = lock(&broker);
        broker.set_reachable(false);
        broker.drop_connections();
    }
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnect);
    assert_eq!(next_event(&mut events).await, SessionEvent::Close);
    let took = lost.elapsed();
    assert!(took < Duration::from_secs(2), "closed after {took:?}");
    assert!(took >= Duration::from_millis(250), "closed after {took:?}");
}

#[tokio::test]
async fn test_time_series_append_and_fetch_events() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    session
        .add_topic("series", TopicSpecification::time_series(TopicType::Double))
        .await
        .unwrap();
    session.add_topic("plain", TopicType::Double).await.unwrap();

    for (n, value) in [0.5, 1.5, 2.5].into_iter().enumerate() {
        let metadata = session.append("series", value).await.unwrap();
        assert_eq!(metadata.sequence, n as u64);
        assert!(metadata.timestamp > 0);
    }
    let values: Vec<TopicValue> = session
        .fetch_events("series")
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.value)
        .collect();
    assert_eq!(values, vec![0.5.into(), 1.5.into(), 2.5.into()]);
    assert_eq!(session.fetch("series").await, Ok(Some(TopicValue::Double(2.5))));

    // refused locally
    assert!(matches!(
        session.append("plain", 1.0).await,
        Err(SessionError::IncompatibleTopic { .. })
    ));
    assert!(matches!(
        session.append("series", "text").await,
        Err(SessionError::TypeMismatch { .. })
    ));
    // refused by the broker
    assert!(matches!(
        session.fetch_events("plain").await,
        Err(SessionError::IncompatibleTopic { .. })
    ));
}

#[tokio::test]
async fn test_topic_views_follow_their_sources() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    session.add_topic("sensors/a", TopicType::Int64).await.unwrap();
    session.update("sensors/a", 1i64).await.unwrap();

    let view = session
        .create_topic_view("sensors", "map ?sensors// to views/sensors")
        .await
        .unwrap();
    assert_eq!(view.name, "sensors");
    assert!(view.roles.contains("control"));

    let mut stream = session.subscribe("views/sensors/a").await.unwrap();
    assert_eq!(
        within(stream.recv()).await.map(|e| e.new_value),
        Some(TopicValue::Int64(1))
    );
    session.update("sensors/a", 2i64).await.unwrap();
    assert_eq!(
        within(stream.recv()).await.map(|e| e.new_value),
        Some(TopicValue::Int64(2))
    );
    assert!(matches!(
        session.update("views/sensors/a", 3i64).await,
        Err(SessionError::IncompatibleTopic { .. })
    ));

    assert_eq!(session.list_topic_views().await, Ok(vec![view.clone()]));
    assert_eq!(session.get_topic_view("sensors").await, Ok(Some(view)));
    assert!(matches!(
        session.create_topic_view("broken", "map sensors").await,
        Err(SessionError::InvalidTopicView { .. })
    ));
    assert!(matches!(
        session.create_topic_view(" ", "map a to b").await,
        Err(SessionError::InvalidTopicView { .. })
    ));

    session.remove_topic_view("sensors").await.unwrap();
    assert_eq!(session.get_topic_view("sensors").await, Ok(None));
    assert!(lock(&broker).topic("views/sensors/a").is_none());
    session.remove_topic_view("sensors").await.unwrap();
}

#[tokio::test]
async fn test_broker_restart_replays_topic_views() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    session
        .add_topic("sensors/a", TopicSpecification::time_series(TopicType::Int64))
        .await
        .unwrap();
    session
        .create_topic_view("mirror", "map sensors/a to views/a")
        .await
        .unwrap();

    let mut events = session.events();
    lock(&broker).restart();
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnect);
    assert_eq!(next_event(&mut events).await, SessionEvent::Reconnect);

    let views = session.list_topic_views().await.unwrap();
    assert_eq!(views.len(), 1);
    assert_eq!(views[0].specification, "map sensors/a to views/a");
    let reference = lock(&broker).topic("views/a").map(|t| t.specification());
    assert_eq!(
        reference,
        Some(TopicSpecification::time_series(TopicType::Int64))
    );

    // a removed view is not brought back
    session.remove_topic_view("mirror").await.unwrap();
    lock(&broker).restart();
    assert_eq!(next_event(&mut events).await, SessionEvent::Disconnect);
    assert_eq!(next_event(&mut events).await, SessionEvent::Reconnect);
    assert_eq!(session.list_topic_views().await, Ok(vec![]));
}

#[tokio::test]
async fn test_non_finite_values_fail_without_a_round_trip() {
    let broker = shared(Broker::new());
    let session = connect(&broker, "control", options()).await;
    session.add_topic("random/Double", TopicType::Double).await.unwrap();

    assert_eq!(
        within(session.update("random/Double", f64::NAN)).await,
        Err(SessionError::InvalidValue {
            path: "random/Double".to_string(),
            reason: "NaN is not a finite double".to_string(),
        })
    );
    assert!(matches!(
        session.send_to_session(&session.id(), ">echo", f64::INFINITY).await,
        Err(SessionError::InvalidValue { .. })
    ));
    assert!(matches!(
        session.send_to_filter("all", ">echo", f64::NEG_INFINITY).await,
        Err(SessionError::InvalidValue { .. })
    ));
    session.update("random/Double", 0.5).await.unwrap();
    assert_eq!(
        session.fetch("random/Double").await,
        Ok(Some(TopicValue::Double(0.5)))
    );
}

#[tokio::test]
async fn test_held_request_does_not_keep_session_alive() {
    let broker = shared(Broker::new());
    let requester = connect(&broker, "control", options()).await;
    let worker = connect(&broker, "worker", options()).await;
    let mut requests = worker.add_request_handler(">slow").await.unwrap();

    let reply = {
        let requester = requester.clone();
        let target = worker.id();
        tokio::spawn(async move { requester.send_to_session(&target, ">slow", "x").await })
    };
    let request = within(requests.recv()).await.unwrap();

    drop(worker);
    wait_for_sessions(&broker, 1).await;
    assert!(matches!(
        within(reply).await.unwrap(),
        Err(SessionError::RequestFailed(_))
    ));
    assert_eq!(
        request.respond("late"),
        Err(SessionError::SessionNotConnected)
    );
}
