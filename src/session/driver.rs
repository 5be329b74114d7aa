//! Session driver
//!
//! One driver task runs per session. It is the only owner of the connection,
//! the reconnector, the topic registry and every waiter, so none of that state
//! is ever shared or locked. `Session` handles talk to it through `Command`s.
//!
//! The driver multiplexes two inputs:
//! - commands from handles, which become frames tagged with a fresh
//!   conversation id and are parked in `pending` until the broker answers;
//! - inbound frames, which settle pending round trips, feed subscription and
//!   filtered-response streams, or deliver requests to handlers.
//!
//! The driver also makes the first connection, so the session is observable
//! in `Connecting`. Operations issued meanwhile wait for it like they would
//! during recovery.
//!
//! When the inbound stream ends the driver enters recovery. Pending round
//! trips are kept and sent again once a new connection is up, in conversation
//! order, so per-topic update order survives a reconnection. The broker
//! recognises frames it has already applied by their conversation id.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::messaging::{CloseReason, Correlator, IncomingRequest, Responder};
use crate::reconnect::{ReconnectDecision, Reconnector};
use crate::session::command::{Command, Operation, Reply};
use crate::session::{RecoveryPolicy, SessionEvent, SessionState};
use crate::topic::stream::Subscription;
use crate::topic::{AddTopicResult, MessagePath, TopicPath, TopicRegistry, TopicValue};
use crate::transport::{
    ClientFrame, Connection, Connector, ConversationId, ErrorReport, OpenRequest, RequestId,
    ServerFrame, SessionId,
};
use crate::utils::error::{Result, SessionError};

enum Pending {
    /// A round trip some caller is waiting for.
    Call {
        op: Operation,
        frame: ClientFrame,
        reply: oneshot::Sender<Result<Reply>>,
    },
    /// A round trip the driver issued on its own: replays and cleanups.
    Internal(ClientFrame),
}

impl Pending {
    fn frame(&self) -> &ClientFrame {
        match self {
            Pending::Call { frame, .. } | Pending::Internal(frame) => frame,
        }
    }
}

enum Wake {
    Command(Option<Command>),
    Frame(Option<ServerFrame>),
}

pub(crate) struct Channels {
    pub commands: mpsc::UnboundedReceiver<Command>,
    pub handle: mpsc::WeakUnboundedSender<Command>,
    pub state: watch::Sender<SessionState>,
    pub session_id: watch::Sender<SessionId>,
    pub events: broadcast::Sender<SessionEvent>,
    pub attempts: Arc<AtomicU32>,
}

pub(crate) struct Driver {
    connector: Arc<dyn Connector>,
    request: OpenRequest,
    recovery: RecoveryPolicy,
    reconnector: Reconnector,
    connection: Option<Connection>,
    channels: Channels,
    next_cid: ConversationId,
    pending: BTreeMap<ConversationId, Pending>,
    // responses to incoming requests produced while recovering
    outbox: VecDeque<ClientFrame>,
    registry: TopicRegistry,
    subscriptions: HashMap<TopicPath, Subscription>,
    handlers: HashMap<MessagePath, mpsc::UnboundedSender<IncomingRequest>>,
    correlator: Correlator,
    // told how the first connection went
    opened: Option<oneshot::Sender<Result<()>>>,
}

impl Driver {
    pub(crate) fn new(
        connector: Arc<dyn Connector>,
        request: OpenRequest,
        recovery: RecoveryPolicy,
        reconnector: Reconnector,
        channels: Channels,
        opened: oneshot::Sender<Result<()>>,
    ) -> Self {
        Self {
            connector,
            request,
            recovery,
            reconnector,
            connection: None,
            channels,
            next_cid: 1,
            pending: BTreeMap::new(),
            outbox: VecDeque::new(),
            registry: TopicRegistry::new(),
            subscriptions: HashMap::new(),
            handlers: HashMap::new(),
            correlator: Correlator::new(),
            opened: Some(opened),
        }
    }

    pub(crate) async fn run(mut self) {
        if !self.establish().await {
            return;
        }
        loop {
            let wake = match self.connection.as_mut() {
                Some(connection) => tokio::select! {
                    command = self.channels.commands.recv() => Wake::Command(command),
                    frame = connection.receive() => Wake::Frame(frame),
                },
                None => Wake::Frame(None),
            };

            let running = match wake {
                Wake::Command(Some(command)) => self.handle_command(command),
                Wake::Command(None) => {
                    debug!("All handles of session {} dropped", self.id());
                    self.shutdown(SessionError::SessionNotConnected);
                    false
                }
                Wake::Frame(Some(frame)) => {
                    self.handle_frame(frame);
                    true
                }
                Wake::Frame(None) => self.recover().await,
            };

            if !running {
                break;
            }
        }
    }

    fn id(&self) -> SessionId {
        self.channels.session_id.borrow().clone()
    }

    fn state(&self) -> SessionState {
        *self.channels.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        self.channels.state.send_replace(state);
    }

    fn emit(&self, event: SessionEvent) {
        // no subscribers is fine
        let _ = self.channels.events.send(event);
    }

    fn allocate_cid(&mut self) -> ConversationId {
        let cid = self.next_cid;
        self.next_cid += 1;
        cid
    }

    /// Write a frame if a connection is up. A failed write is not an error
    /// here: the inbound side ends as well and recovery takes over.
    fn transmit(&self, frame: ClientFrame) -> bool {
        match self.connection.as_ref() {
            Some(connection) => match connection.send(frame) {
                Ok(()) => true,
                Err(e) => {
                    debug!("Dropping frame on session {}: {e}", self.id());
                    false
                }
            },
            None => false,
        }
    }

    /// Returns `false` once the session has ended.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Call { op, reply } => {
                self.start_call(op, reply);
                true
            }
            Command::Respond { request_id, result } => {
                let frame = match result {
                    Ok(value) => ClientFrame::Respond { request_id, value },
                    Err(message) => ClientFrame::RespondError {
                        request_id,
                        message,
                    },
                };
                match self.state() {
                    SessionState::Connected => {
                        self.transmit(frame);
                    }
                    _ => self.outbox.push_back(frame),
                }
                true
            }
            Command::Close { done } => {
                info!("Closing session {}", self.id());
                self.shutdown(SessionError::SessionNotConnected);
                let _ = done.send(());
                false
            }
        }
    }

    fn start_call(&mut self, op: Operation, reply: oneshot::Sender<Result<Reply>>) {
        let checked = match &op {
            Operation::Update { path, value } => self.registry.check(path, value),
            Operation::Append { path, value } => self.registry.check_append(path, value),
            _ => Ok(()),
        };
        if let Err(e) = checked {
            let _ = reply.send(Err(e));
            return;
        }

        let state = self.state();
        if state == SessionState::Recovering && self.recovery == RecoveryPolicy::FailFast {
            let _ = reply.send(Err(SessionError::SessionNotConnected));
            return;
        }

        let cid = self.allocate_cid();
        let frame = op.frame(cid);
        debug!("Session {} starts {} as conversation {cid}", self.id(), op.name());
        if state == SessionState::Connected {
            self.transmit(frame.clone());
        }
        self.pending.insert(cid, Pending::Call { op, frame, reply });
    }

    /// Issue a round trip nobody waits for.
    fn start_internal(&mut self, make: impl FnOnce(ConversationId) -> ClientFrame) {
        let cid = self.allocate_cid();
        let frame = make(cid);
        self.transmit(frame.clone());
        self.pending.insert(cid, Pending::Internal(frame));
    }

    fn handle_frame(&mut self, frame: ServerFrame) {
        if let Some(cid) = frame.reply_to() {
            self.settle(cid, frame);
            return;
        }

        match frame {
            ServerFrame::FilterResponse { cid, from, value } => {
                self.correlator.deliver(cid, from, Ok(value));
            }
            ServerFrame::FilterResponseError { cid, from, message } => {
                self.correlator.deliver(cid, from, Err(message));
            }
            ServerFrame::Request {
                request_id,
                from,
                path,
                payload,
            } => self.dispatch_request(request_id, from, path, payload),
            ServerFrame::Value {
                path,
                value,
                timestamp,
            } => {
                let delivered = match self.subscriptions.get_mut(&path) {
                    Some(subscription) => subscription.deliver(&path, value, timestamp),
                    None => return,
                };
                if !delivered {
                    debug!("Value stream for {path} dropped, unsubscribing");
                    self.subscriptions.remove(&path);
                    self.start_internal(|cid| ClientFrame::Unsubscribe { cid, path });
                }
            }
            other => warn!("Unexpected frame on session {}: {other:?}", self.id()),
        }
    }

    fn dispatch_request(
        &mut self,
        request_id: RequestId,
        from: SessionId,
        path: MessagePath,
        payload: TopicValue,
    ) {
        let Some(requests) = self.handlers.get(&path).cloned() else {
            self.transmit(ClientFrame::RespondError {
                request_id,
                message: format!("no request handler registered for '{path}'"),
            });
            return;
        };
        let request = IncomingRequest {
            from,
            path: path.clone(),
            payload,
            responder: Responder::new(request_id, path.clone(), self.channels.handle.clone()),
        };
        // a rejected request is dropped here, which answers it with an error
        if requests.send(request).is_err() {
            self.handlers.remove(&path);
        }
    }

    fn settle(&mut self, cid: ConversationId, frame: ServerFrame) {
        let Some(pending) = self.pending.remove(&cid) else {
            debug!("Ignoring reply for unknown conversation {cid}");
            return;
        };

        match pending {
            Pending::Internal(sent) => {
                if let ServerFrame::Failed { error, .. } = frame {
                    warn!("Session {} could not restore {sent:?}: {error:?}", self.id());
                    match sent {
                        ClientFrame::AddTopic { path, .. } => {
                            self.registry.remove(&path);
                        }
                        ClientFrame::CreateTopicView { name, .. } => {
                            self.registry.remove_view(&name);
                        }
                        _ => {}
                    }
                }
            }
            Pending::Call { op, reply, .. } => {
                let result = self.apply(op, frame);
                if reply.send(result).is_err() {
                    debug!("Caller of conversation {cid} went away");
                }
            }
        }
    }

    /// Turn a reply into the caller's result, updating local state on success.
    fn apply(&mut self, op: Operation, frame: ServerFrame) -> Result<Reply> {
        match (op, frame) {
            (Operation::RemoveTopic { path }, ServerFrame::Failed { error, .. }) => {
                if matches!(error, ErrorReport::TopicNotFound { .. }) {
                    self.registry.remove(&path);
                }
                Err(error.into())
            }
            (_, ServerFrame::Failed { error, .. }) => Err(error.into()),
            (
                Operation::AddTopic {
                    path,
                    specification,
                },
                ServerFrame::TopicAdded { created, .. },
            ) => {
                self.registry.insert(path, specification);
                Ok(Reply::Added(if created {
                    AddTopicResult::Created
                } else {
                    AddTopicResult::Exists
                }))
            }
            (Operation::RemoveTopic { path }, ServerFrame::Done { .. }) => {
                self.registry.remove(&path);
                Ok(Reply::Done)
            }
            (Operation::Update { .. }, ServerFrame::Done { .. }) => Ok(Reply::Done),
            (Operation::Fetch { .. }, ServerFrame::Fetched { value, .. }) => {
                Ok(Reply::Fetched(value))
            }
            (Operation::Append { .. }, ServerFrame::Appended { metadata, .. }) => {
                Ok(Reply::Appended(metadata))
            }
            (Operation::FetchEvents { .. }, ServerFrame::Events { events, .. }) => {
                Ok(Reply::Events(events))
            }
            (
                Operation::CreateTopicView {
                    name,
                    specification,
                },
                ServerFrame::TopicView { view, .. },
            ) => {
                self.registry.insert_view(name, specification);
                Ok(Reply::View(view))
            }
            (Operation::RemoveTopicView { name }, ServerFrame::Done { .. }) => {
                self.registry.remove_view(&name);
                Ok(Reply::Done)
            }
            (Operation::ListTopicViews, ServerFrame::TopicViews { views, .. }) => {
                Ok(Reply::Views(views))
            }
            (Operation::GetTopicView { .. }, ServerFrame::TopicView { view, .. }) => {
                Ok(Reply::View(view))
            }
            (Operation::Subscribe { path, events }, ServerFrame::Done { .. }) => {
                self.subscriptions.insert(path, Subscription::new(events));
                Ok(Reply::Done)
            }
            (Operation::Unsubscribe { path }, ServerFrame::Done { .. }) => {
                self.subscriptions.remove(&path);
                Ok(Reply::Done)
            }
            (Operation::AddRequestHandler { path, requests }, ServerFrame::Done { .. }) => {
                self.handlers.insert(path, requests);
                Ok(Reply::Done)
            }
            (Operation::RemoveRequestHandler { path }, ServerFrame::Done { .. }) => {
                self.handlers.remove(&path);
                Ok(Reply::Done)
            }
            (Operation::SendToFilter { events, .. }, ServerFrame::Dispatched { cid, matched }) => {
                self.correlator.open(cid, matched, events);
                Ok(Reply::Dispatched(matched))
            }
            (Operation::SendToSession { .. }, ServerFrame::Response { value, .. }) => {
                Ok(Reply::Response(value))
            }
            (op, other) => Err(SessionError::Protocol(format!(
                "unexpected reply to {}: {other:?}",
                op.name()
            ))),
        }
    }

    /// Open the first connection. Returns `false` if the session ended
    /// instead.
    async fn establish(&mut self) -> bool {
        info!(
            "Connecting to {} as {}",
            self.request.endpoint, self.request.credentials.principal
        );
        let open = self.connector.open(self.request.clone());
        tokio::pin!(open);
        let outcome = loop {
            tokio::select! {
                outcome = &mut open => break outcome,
                command = self.channels.commands.recv() => {
                    if !self.serve_while_waiting(command) {
                        return false;
                    }
                }
            }
        };

        let connection = match outcome {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Connecting to {} failed: {e}", self.request.endpoint);
                self.shutdown(e);
                return false;
            }
        };
        info!("Session {} connected", connection.session_id());
        self.channels
            .session_id
            .send_replace(connection.session_id().clone());
        self.connection = Some(connection);

        let waiting: Vec<ClientFrame> = self.pending.values().map(|p| p.frame().clone()).collect();
        for frame in waiting {
            self.transmit(frame);
        }
        self.set_state(SessionState::Connected);
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(Ok(()));
        }
        true
    }

    /// Run recovery after the connection was lost. Returns `false` if the
    /// session ended instead of reconnecting.
    async fn recover(&mut self) -> bool {
        if let Some(mut connection) = self.connection.take() {
            connection.close();
        }
        warn!("Session {} lost its connection", self.id());
        self.set_state(SessionState::Recovering);
        self.emit(SessionEvent::Disconnect);
        self.reconnector.begin();

        loop {
            let delay = match self.reconnector.next_attempt() {
                ReconnectDecision::Wait(delay) => delay,
                ReconnectDecision::Abort => {
                    warn!(
                        "Giving up on session {} after {} attempts",
                        self.id(),
                        self.reconnector.attempts()
                    );
                    self.shutdown(SessionError::Timeout);
                    return false;
                }
            };
            // never sleep past the point where the policy gives up
            let delay = delay.min(self.reconnector.remaining());
            let attempt = self.reconnector.attempts();
            self.channels.attempts.store(attempt, Ordering::Relaxed);
            debug!("Reconnect attempt {attempt} for session {} in {delay:?}", self.id());

            let sleep = tokio::time::sleep(delay);
            tokio::pin!(sleep);
            loop {
                tokio::select! {
                    _ = &mut sleep => break,
                    command = self.channels.commands.recv() => {
                        if !self.serve_while_waiting(command) {
                            return false;
                        }
                    }
                }
            }
            if self.reconnector.remaining().is_zero() {
                continue;
            }

            let request = OpenRequest {
                resume: Some(self.id()),
                ..self.request.clone()
            };
            let open = tokio::time::timeout(
                self.reconnector.remaining(),
                self.connector.open(request),
            );
            tokio::pin!(open);
            let outcome = loop {
                tokio::select! {
                    outcome = &mut open => break outcome,
                    command = self.channels.commands.recv() => {
                        if !self.serve_while_waiting(command) {
                            return false;
                        }
                    }
                }
            };

            match outcome {
                Ok(Ok(connection)) => {
                    self.restore(connection);
                    return true;
                }
                Ok(Err(e)) => debug!("Reconnect attempt {attempt} failed: {e}"),
                Err(_) => debug!("Reconnect attempt {attempt} ran out of time"),
            }
        }
    }

    fn serve_while_waiting(&mut self, command: Option<Command>) -> bool {
        match command {
            Some(command) => self.handle_command(command),
            None => {
                self.shutdown(SessionError::SessionNotConnected);
                false
            }
        }
    }

    fn restore(&mut self, connection: Connection) {
        let previous = self.id();
        let resumed = connection.resumed();
        let current = connection.session_id().clone();
        self.connection = Some(connection);

        // conversations started before the replay below
        let outstanding: Vec<ConversationId> = self.pending.keys().copied().collect();

        if resumed {
            info!("Session {previous} resumed");
        } else {
            info!(
                "Broker did not resume session {previous}, continuing as {current} and replaying state"
            );
            self.channels.session_id.send_replace(current);
            self.correlator.retire_all(CloseReason::SessionLost);
            self.replay();
        }

        for cid in outstanding {
            if let Some(frame) = self.pending.get(&cid).map(|p| p.frame().clone()) {
                self.transmit(frame);
            }
        }

        while let Some(frame) = self.outbox.pop_front() {
            if !self.transmit(frame.clone()) {
                self.outbox.push_front(frame);
                break;
            }
        }

        self.reconnector.reset();
        self.channels.attempts.store(0, Ordering::Relaxed);
        self.set_state(SessionState::Connected);
        self.emit(SessionEvent::Reconnect);
    }

    /// Re-register topics, topic views, subscriptions and request handlers
    /// with a broker that no longer knows this session. Views come after
    /// topics so their sources exist.
    fn replay(&mut self) {
        let topics: Vec<_> = self
            .registry
            .iter()
            .map(|(path, specification)| (path.clone(), specification))
            .collect();
        let views: Vec<(String, String)> = self
            .registry
            .views()
            .map(|(name, specification)| (name.to_string(), specification.to_string()))
            .collect();
        let subscriptions: Vec<TopicPath> = self.subscriptions.keys().cloned().collect();
        let handlers: Vec<MessagePath> = self.handlers.keys().cloned().collect();
        debug!(
            "Replaying {} topics, {} views, {} subscriptions, {} handlers",
            topics.len(),
            views.len(),
            subscriptions.len(),
            handlers.len()
        );

        for (path, specification) in topics {
            self.start_internal(|cid| ClientFrame::AddTopic {
                cid,
                path,
                specification,
            });
        }
        for (name, specification) in views {
            self.start_internal(|cid| ClientFrame::CreateTopicView {
                cid,
                name,
                specification,
            });
        }
        for path in subscriptions {
            self.start_internal(|cid| ClientFrame::Subscribe { cid, path });
        }
        for path in handlers {
            self.start_internal(|cid| ClientFrame::AddRequestHandler { cid, path });
        }
    }

    fn shutdown(&mut self, error: SessionError) {
        if let Some(mut connection) = self.connection.take() {
            let _ = connection.send(ClientFrame::Close);
            connection.close();
        }

        for (_, pending) in std::mem::take(&mut self.pending) {
            if let Pending::Call { reply, .. } = pending {
                let _ = reply.send(Err(error.clone()));
            }
        }
        self.outbox.clear();
        self.correlator.retire_all(CloseReason::SessionClosed);
        self.subscriptions.clear();
        self.handlers.clear();

        self.set_state(SessionState::Closed);
        self.emit(SessionEvent::Close);
        if let Some(opened) = self.opened.take() {
            let _ = opened.send(Err(error.clone()));
        }
        info!("Session {} closed", self.id());
        debug!("Outstanding operations failed with: {error}");
    }
}
