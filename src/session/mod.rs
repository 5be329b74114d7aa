//! The `session` module is the client's public face.
//!
//! `Session::start` spawns the driver task, which opens the connection and
//! owns it; `Session::connect` does the same and waits for the handshake.
//! The returned `Session` is a cheap, cloneable handle: every
//! operation is a message to the driver plus a wait for its reply. Dropping
//! the future of an operation cancels only the local wait. The frame may
//! already be on its way, so whether the broker applied it is unknown.
//!
//! State machine:
//! - `Connecting -> Connected` when the handshake succeeds;
//! - `Connecting -> Closed` when it fails, and `connect` returns the error;
//! - `Connected -> Recovering` when the connection is lost (`Disconnect`);
//! - `Recovering -> Connected` when a reconnection succeeds (`Reconnect`);
//! - `Recovering -> Closed` when the reconnect policy aborts (`Close`);
//! - any state `-> Closed` on `close()`, which never fails.

pub mod command;
mod driver;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::Settings;
use crate::messaging::{FilteredResponses, RequestStream};
use crate::reconnect::{ExponentialBackoff, ReconnectPolicy, Reconnector};
use crate::topic::{
    AddTopicResult, EventMetadata, MessagePath, TimeSeriesEvent, TopicPath, TopicSpecification,
    TopicValue, TopicView, ValueStream,
};
use crate::transport::{Connector, Credentials, OpenRequest, SessionId, WebSocketConnector};
use crate::utils::error::{Result, SessionError};
use command::{Command, Operation, Reply};
use driver::{Channels, Driver};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// The first connection is being opened. Operations wait for it.
    Connecting,
    Connected,
    Recovering,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Disconnect,
    Reconnect,
    Close,
}

/// What happens to operations issued while the session is recovering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryPolicy {
    /// Hold them and send them once the session is connected again. They fail
    /// with `Timeout` if recovery gives up.
    #[default]
    Queue,
    /// Fail them at once with `SessionNotConnected`.
    FailFast,
}

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub secure: bool,
    pub reconnect: ReconnectPolicy,
    pub recovery: RecoveryPolicy,
    pub tls: Option<Arc<rustls::ClientConfig>>,
}

impl SessionOptions {
    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    pub fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    pub fn recovery(mut self, recovery: RecoveryPolicy) -> Self {
        self.recovery = recovery;
        self
    }

    /// TLS configuration used for certificate validation. Implies `secure`.
    pub fn tls_config(mut self, config: Arc<rustls::ClientConfig>) -> Self {
        self.secure = true;
        self.tls = Some(config);
        self
    }
}

impl From<&Settings> for SessionOptions {
    fn from(settings: &Settings) -> Self {
        let reconnect = &settings.reconnect;
        let backoff = ExponentialBackoff::new(
            Duration::from_millis(reconnect.base_interval_ms),
            Duration::from_millis(reconnect.max_interval_ms),
        );
        Self {
            secure: settings.session.secure,
            reconnect: ReconnectPolicy::new(backoff, Duration::from_secs(reconnect.timeout_secs)),
            recovery: if reconnect.queue_while_recovering {
                RecoveryPolicy::Queue
            } else {
                RecoveryPolicy::FailFast
            },
            tls: None,
        }
    }
}

#[derive(Debug)]
struct Inner {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionState>,
    session_id: watch::Receiver<SessionId>,
    events: broadcast::Sender<SessionEvent>,
    attempts: Arc<AtomicU32>,
}

/// Handle on a broker session. Clones share the same session; it closes when
/// `close()` is called or the last clone is dropped.
#[derive(Debug, Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Connect to a broker over WebSocket.
    pub async fn connect(
        endpoint: &str,
        credentials: Credentials,
        options: SessionOptions,
    ) -> Result<Self> {
        let mut connector = WebSocketConnector::new(options.secure);
        if let Some(tls) = options.tls.clone() {
            connector = connector.with_tls_config(tls);
        }
        Self::connect_with(Arc::new(connector), endpoint, credentials, options).await
    }

    /// Connect through any `Connector`.
    pub async fn connect_with(
        connector: Arc<dyn Connector>,
        endpoint: &str,
        credentials: Credentials,
        options: SessionOptions,
    ) -> Result<Self> {
        let (session, opened) = Self::spawn(connector, endpoint, credentials, options);
        opened
            .await
            .map_err(|_| SessionError::SessionNotConnected)??;
        Ok(session)
    }

    /// Start connecting through `connector` without waiting. The session is
    /// `Connecting` until the handshake completes, then `Connected`, or
    /// `Closed` if it fails. Must be called within a Tokio runtime.
    pub fn start(
        connector: Arc<dyn Connector>,
        endpoint: &str,
        credentials: Credentials,
        options: SessionOptions,
    ) -> Self {
        Self::spawn(connector, endpoint, credentials, options).0
    }

    fn spawn(
        connector: Arc<dyn Connector>,
        endpoint: &str,
        credentials: Credentials,
        options: SessionOptions,
    ) -> (Self, oneshot::Receiver<Result<()>>) {
        let request = OpenRequest {
            endpoint: endpoint.to_string(),
            credentials,
            resume: None,
        };

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let (id_tx, id_rx) = watch::channel(SessionId::default());
        let (events_tx, _) = broadcast::channel(16);
        let attempts = Arc::new(AtomicU32::new(0));

        let channels = Channels {
            commands: commands_rx,
            handle: commands_tx.downgrade(),
            state: state_tx,
            session_id: id_tx,
            events: events_tx.clone(),
            attempts: attempts.clone(),
        };
        let (opened_tx, opened_rx) = oneshot::channel();
        let driver = Driver::new(
            connector,
            request,
            options.recovery,
            Reconnector::new(options.reconnect),
            channels,
            opened_tx,
        );
        tokio::spawn(driver.run());

        let session = Self {
            inner: Arc::new(Inner {
                commands: commands_tx,
                state: state_rx,
                session_id: id_rx,
                events: events_tx,
                attempts,
            }),
        };
        (session, opened_rx)
    }

    /// Broker-assigned id, empty while `Connecting`. Changes if the broker
    /// could not resume the session after a reconnection.
    pub fn id(&self) -> SessionId {
        self.inner.session_id.borrow().clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Wait until the session reaches `target`. Fails if the session closed
    /// without getting there.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut state = self.inner.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| SessionError::SessionNotConnected)
    }

    /// Lifecycle notifications emitted after this call.
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Reconnection attempts made during the current outage.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// Shorthand for `state() == SessionState::Closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == SessionState::Closed
    }

    async fn call(&self, op: Operation) -> Result<Reply> {
        let (reply, response) = oneshot::channel();
        self.inner
            .commands
            .send(Command::Call { op, reply })
            .map_err(|_| SessionError::SessionNotConnected)?;
        response
            .await
            .map_err(|_| SessionError::SessionNotConnected)?
    }

    /// Create a topic from a `TopicType` or a full `TopicSpecification`.
    /// Adding a topic that already exists with the same specification
    /// succeeds with `AddTopicResult::Exists`.
    pub async fn add_topic(
        &self,
        path: &str,
        specification: impl Into<TopicSpecification>,
    ) -> Result<AddTopicResult> {
        let path = TopicPath::parse(path)?;
        let specification = specification.into();
        match self.call(Operation::AddTopic { path, specification }).await? {
            Reply::Added(result) => Ok(result),
            other => Err(unexpected(other)),
        }
    }

    /// Remove a topic. Reference topics of views mapping it go with it.
    pub async fn remove_topic(&self, path: &str) -> Result<()> {
        let path = TopicPath::parse(path)?;
        self.call(Operation::RemoveTopic { path }).await.and_then(done)
    }

    /// Set the value of a topic. Updates from one session to one topic are
    /// applied in the order they were issued. Non-finite doubles fail with
    /// `InvalidValue` before anything is sent.
    pub async fn update(&self, path: &str, value: impl Into<TopicValue>) -> Result<()> {
        let path = TopicPath::parse(path)?;
        let value = value.into();
        SessionError::check_value(path.as_str(), &value)?;
        self.call(Operation::Update { path, value })
            .await
            .and_then(done)
    }

    /// Append an event to a time series topic.
    pub async fn append(&self, path: &str, value: impl Into<TopicValue>) -> Result<EventMetadata> {
        let path = TopicPath::parse(path)?;
        let value = value.into();
        SessionError::check_value(path.as_str(), &value)?;
        match self.call(Operation::Append { path, value }).await? {
            Reply::Appended(metadata) => Ok(metadata),
            other => Err(unexpected(other)),
        }
    }

    /// Events a time series topic still retains, oldest first.
    pub async fn fetch_events(&self, path: &str) -> Result<Vec<TimeSeriesEvent>> {
        let path = TopicPath::parse(path)?;
        match self.call(Operation::FetchEvents { path }).await? {
            Reply::Events(events) => Ok(events),
            other => Err(unexpected(other)),
        }
    }

    /// Create or replace the topic view `name`, e.g. with the specification
    /// `map ?sensors// to views/sensors`. The view is recreated if the broker
    /// loses this session.
    pub async fn create_topic_view(&self, name: &str, specification: &str) -> Result<TopicView> {
        if name.trim().is_empty() {
            return Err(SessionError::InvalidTopicView {
                view: name.to_string(),
                reason: "view name is empty".to_string(),
            });
        }
        let op = Operation::CreateTopicView {
            name: name.to_string(),
            specification: specification.to_string(),
        };
        match self.call(op).await? {
            Reply::View(Some(view)) => Ok(view),
            other => Err(unexpected(other)),
        }
    }

    /// Remove a topic view and its reference topics. Removing a view that
    /// does not exist succeeds.
    pub async fn remove_topic_view(&self, name: &str) -> Result<()> {
        let op = Operation::RemoveTopicView {
            name: name.to_string(),
        };
        self.call(op).await.and_then(done)
    }

    /// Every view on the broker, by name.
    pub async fn list_topic_views(&self) -> Result<Vec<TopicView>> {
        match self.call(Operation::ListTopicViews).await? {
            Reply::Views(views) => Ok(views),
            other => Err(unexpected(other)),
        }
    }

    /// The view called `name`, `None` if there is none.
    pub async fn get_topic_view(&self, name: &str) -> Result<Option<TopicView>> {
        let op = Operation::GetTopicView {
            name: name.to_string(),
        };
        match self.call(op).await? {
            Reply::View(view) => Ok(view),
            other => Err(unexpected(other)),
        }
    }

    /// Current value of a topic, `None` if it was never updated.
    pub async fn fetch(&self, path: &str) -> Result<Option<TopicValue>> {
        let path = TopicPath::parse(path)?;
        match self.call(Operation::Fetch { path }).await? {
            Reply::Fetched(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Follow a topic. The current value, if any, arrives first. Subscribing
    /// again to the same path replaces the previous stream.
    pub async fn subscribe(&self, path: &str) -> Result<ValueStream> {
        let path = TopicPath::parse(path)?;
        let (events, stream) = mpsc::unbounded_channel();
        self.call(Operation::Subscribe {
            path: path.clone(),
            events,
        })
        .await
        .and_then(done)?;
        Ok(ValueStream::new(path, stream))
    }

    /// Stop following a topic. Its value stream ends.
    pub async fn unsubscribe(&self, path: &str) -> Result<()> {
        let path = TopicPath::parse(path)?;
        self.call(Operation::Unsubscribe { path })
            .await
            .and_then(done)
    }

    /// Receive requests sent to `path` by other sessions.
    pub async fn add_request_handler(&self, path: &str) -> Result<RequestStream> {
        let path = MessagePath::parse(path)?;
        let (requests, stream) = mpsc::unbounded_channel();
        self.call(Operation::AddRequestHandler {
            path: path.clone(),
            requests,
        })
        .await
        .and_then(done)?;
        Ok(RequestStream::new(path, stream))
    }

    /// Stop handling `path`. The request stream ends.
    pub async fn remove_request_handler(&self, path: &str) -> Result<()> {
        let path = MessagePath::parse(path)?;
        self.call(Operation::RemoveRequestHandler { path })
            .await
            .and_then(done)
    }

    /// Send one request to every session matching `filter` that handles
    /// `path`. The returned stream yields one answer per matched session and
    /// then a single `Closed` event.
    pub async fn send_to_filter(
        &self,
        filter: &str,
        path: &str,
        payload: impl Into<TopicValue>,
    ) -> Result<FilteredResponses> {
        if filter.trim().is_empty() {
            return Err(SessionError::InvalidFilter {
                filter: filter.to_string(),
                reason: "filter is empty".to_string(),
            });
        }
        let path = MessagePath::parse(path)?;
        let payload = payload.into();
        SessionError::check_value(path.as_str(), &payload)?;
        let (events, stream) = mpsc::unbounded_channel();
        let op = Operation::SendToFilter {
            filter: filter.to_string(),
            path,
            payload,
            events,
        };
        match self.call(op).await? {
            Reply::Dispatched(matched) => Ok(FilteredResponses::new(matched, stream)),
            other => Err(unexpected(other)),
        }
    }

    /// Send a request to one session and wait for its answer.
    pub async fn send_to_session(
        &self,
        session_id: &SessionId,
        path: &str,
        payload: impl Into<TopicValue>,
    ) -> Result<TopicValue> {
        let path = MessagePath::parse(path)?;
        let payload = payload.into();
        SessionError::check_value(path.as_str(), &payload)?;
        let op = Operation::SendToSession {
            session_id: session_id.clone(),
            path,
            payload,
        };
        match self.call(op).await? {
            Reply::Response(value) => Ok(value),
            other => Err(unexpected(other)),
        }
    }

    /// Close the session. Pending operations fail with `SessionNotConnected`.
    /// Calling it again, or on a session that already closed, does nothing.
    pub async fn close(&self) {
        let (done, closed) = oneshot::channel();
        if self.inner.commands.send(Command::Close { done }).is_ok() {
            let _ = closed.await;
        }
    }
}

fn done(reply: Reply) -> Result<()> {
    match reply {
        Reply::Done => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(reply: Reply) -> SessionError {
    SessionError::Protocol(format!("unexpected reply {reply:?}"))
}

#[cfg(test)]
mod tests;
