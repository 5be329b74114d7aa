use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broker::client::{BACKLOG_LIMIT, Client, LinkId, Seen};
use crate::broker::filter::{Filter, SessionAttributes};
use crate::broker::topic::{Reference, Topic};
use crate::broker::view::{View, ViewSpec};
use crate::topic::{MessagePath, TopicPath, TopicSpecification, TopicValue};
use crate::transport::{
    ClientFrame, ConversationId, ErrorReport, RequestId, ServerFrame, SessionId,
};
use crate::utils::error::{Result, SessionError};

/// How long a detached session can be resumed by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60);

/// One transport connection to the broker.
#[derive(Debug)]
struct Link {
    sender: mpsc::UnboundedSender<ServerFrame>,
    severed: Option<oneshot::Sender<()>>,
    session: Option<SessionId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Filtered,
    Direct,
}

/// A request delivered to a handler and not answered yet.
#[derive(Debug)]
struct InFlight {
    requester: SessionId,
    cid: ConversationId,
    recipient: SessionId,
    kind: RequestKind,
}

/// In-memory broker
///
/// Holds topics, topic views, sessions, subscriptions, request handlers and
/// requests in flight. It is synchronous: connection front ends
/// (`LoopbackConnector`, `websocket::serve`) share it behind a mutex, feed it
/// client frames with `receive`, and get server frames back through the
/// sender registered with `accept`.
///
/// Sessions survive their connection for the retention period. A client that
/// reconnects in time and names its session in the `Open` frame gets it back
/// with every frame produced in between. A detached session that would need
/// more than the backlog limit of held frames is expired instead.
#[derive(Debug)]
pub struct Broker {
    links: HashMap<LinkId, Link>,
    next_link: LinkId,
    clients: HashMap<SessionId, Client>,
    topics: BTreeMap<TopicPath, Topic>,
    views: BTreeMap<String, View>,
    subscriptions: HashMap<TopicPath, HashSet<SessionId>>,
    handlers: HashMap<MessagePath, HashSet<SessionId>>,
    requests: HashMap<RequestId, InFlight>,
    next_request: RequestId,
    users: HashMap<String, String>,
    reachable: bool,
    retention: Duration,
    backlog_limit: usize,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    /// Creates a broker that accepts any credentials.
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            next_link: 1,
            clients: HashMap::new(),
            topics: BTreeMap::new(),
            views: BTreeMap::new(),
            subscriptions: HashMap::new(),
            handlers: HashMap::new(),
            requests: HashMap::new(),
            next_request: 1,
            users: HashMap::new(),
            reachable: true,
            retention: DEFAULT_RETENTION,
            backlog_limit: BACKLOG_LIMIT,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Frames held per detached session before it is expired.
    pub fn with_backlog_limit(mut self, limit: usize) -> Self {
        self.backlog_limit = limit;
        self
    }

    /// Once a user is added only known principals with the right password
    /// can open sessions.
    pub fn add_user(&mut self, principal: &str, password: &str) {
        self.users
            .insert(principal.to_string(), password.to_string());
    }

    pub fn with_user(mut self, principal: &str, password: &str) -> Self {
        self.add_user(principal, password);
        self
    }

    /// Registers a new connection. Frames for it are pushed into `sender`.
    /// The returned receiver fires when the broker cuts the connection.
    pub fn accept(
        &mut self,
        sender: mpsc::UnboundedSender<ServerFrame>,
    ) -> Result<(LinkId, oneshot::Receiver<()>)> {
        if !self.reachable {
            return Err(SessionError::connection("broker unreachable"));
        }
        self.purge_expired();

        let id = self.next_link;
        self.next_link += 1;
        let (severed_tx, severed_rx) = oneshot::channel();
        self.links.insert(
            id,
            Link {
                sender,
                severed: Some(severed_tx),
                session: None,
            },
        );
        debug!("Accepted link {id}");
        Ok((id, severed_rx))
    }

    /// Handles one frame received on `link`.
    pub fn receive(&mut self, link: LinkId, frame: ClientFrame) {
        let Some(session) = self.links.get(&link).map(|l| l.session.clone()) else {
            debug!("Frame on unknown link {link}");
            return;
        };

        match (session, frame) {
            (
                None,
                ClientFrame::Open {
                    principal,
                    password,
                    resume,
                },
            ) => self.open(link, &principal, &password, resume),
            (None, _) => {
                self.send_link(
                    link,
                    ServerFrame::Rejected {
                        message: "session is not open".to_string(),
                    },
                );
                self.sever(link);
            }
            (Some(id), ClientFrame::Open { .. }) => {
                warn!("Session {id} sent a second open frame");
            }
            (Some(id), ClientFrame::Close) => {
                info!("Session {id} closed by client");
                self.close_session(&id);
                self.sever(link);
            }
            (Some(id), frame) => self.handle(&id, frame),
        }
    }

    /// Answers conversation `cid` on `link` whose frame could not be decoded.
    pub fn reject_malformed(&mut self, link: LinkId, cid: ConversationId, reason: &str) {
        let Some(Some(id)) = self.links.get(&link).map(|l| l.session.clone()) else {
            return;
        };
        let error = ErrorReport::Rejected {
            message: format!("malformed frame: {reason}"),
        };
        self.fail(&id, cid, error);
    }

    /// Forgets a connection. Its session, if any, stays resumable.
    pub fn detach(&mut self, link: LinkId) {
        let Some(removed) = self.links.remove(&link) else {
            return;
        };
        if let Some(id) = removed.session
            && let Some(client) = self.clients.get_mut(&id)
            && client.link == Some(link)
        {
            debug!("Session {id} detached");
            client.detach();
        }
    }

    /// Cuts every connection, as a network outage would.
    pub fn drop_connections(&mut self) {
        let links: Vec<LinkId> = self.links.keys().copied().collect();
        info!("Dropping {} connections", links.len());
        for link in links {
            self.sever(link);
        }
    }

    /// While unreachable, new connections are refused.
    pub fn set_reachable(&mut self, reachable: bool) {
        self.reachable = reachable;
    }

    /// Cuts every connection and forgets all state, as a broker restart would.
    pub fn restart(&mut self) {
        info!("Restarting broker");
        self.drop_connections();
        self.clients.clear();
        self.topics.clear();
        self.views.clear();
        self.subscriptions.clear();
        self.handlers.clear();
        self.requests.clear();
    }

    /// Sessions known to the broker, attached or not.
    pub fn session_count(&self) -> usize {
        self.clients.len()
    }

    pub fn has_session(&self, id: &SessionId) -> bool {
        self.clients.contains_key(id)
    }

    pub fn topic(&self, path: &str) -> Option<&Topic> {
        let path = TopicPath::parse(path).ok()?;
        self.topics.get(&path)
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    fn sever(&mut self, link: LinkId) {
        if let Some(severed) = self
            .links
            .get_mut(&link)
            .and_then(|l| l.severed.take())
        {
            let _ = severed.send(());
        }
        self.detach(link);
    }

    fn send_link(&self, link: LinkId, frame: ServerFrame) {
        if let Some(l) = self.links.get(&link) {
            let _ = l.sender.send(frame);
        }
    }

    fn open(&mut self, link: LinkId, principal: &str, password: &str, resume: Option<SessionId>) {
        if !self.users.is_empty() && self.users.get(principal).map(String::as_str) != Some(password)
        {
            warn!("Rejected credentials for principal '{principal}'");
            self.send_link(
                link,
                ServerFrame::Rejected {
                    message: "authentication failed".to_string(),
                },
            );
            self.sever(link);
            return;
        }

        let resumable = resume.filter(|id| {
            self.clients
                .get(id)
                .is_some_and(|client| client.principal == principal)
        });

        let (id, resumed) = match resumable {
            Some(id) => {
                let previous = self.clients.get(&id).and_then(|c| c.link);
                if let Some(previous) = previous.filter(|p| *p != link) {
                    self.sever(previous);
                }
                if let Some(client) = self.clients.get_mut(&id) {
                    client.attach(link);
                }
                info!("Session {id} resumed on link {link}");
                (id, true)
            }
            None => {
                let client = Client::new(principal, link);
                let id = client.id.clone();
                self.clients.insert(id.clone(), client);
                info!("Session {id} opened for '{principal}' on link {link}");
                (id, false)
            }
        };

        if let Some(l) = self.links.get_mut(&link) {
            l.session = Some(id.clone());
        }
        self.send_link(
            link,
            ServerFrame::Opened {
                session_id: id.clone(),
                resumed,
            },
        );

        if resumed {
            let backlog = self
                .clients
                .get_mut(&id)
                .map(Client::take_backlog)
                .unwrap_or_default();
            debug!("Flushing {} deferred frames to {id}", backlog.len());
            for frame in backlog {
                self.deliver(&id, frame);
            }
        }
    }

    /// Sends a frame to a session, holding it if the session is detached.
    fn deliver(&mut self, id: &SessionId, frame: ServerFrame) {
        let limit = self.backlog_limit;
        let Some(client) = self.clients.get_mut(id) else {
            return;
        };
        let sent = match client.link.and_then(|link| self.links.get(&link)) {
            Some(link) => link.sender.send(frame.clone()).is_ok(),
            None => false,
        };
        if !sent && !client.defer(frame, limit) {
            warn!("Session {id} has {limit} frames waiting, expiring it");
            self.expire(id);
        }
    }

    /// Ends a session that can no longer be resumed without losing frames.
    fn expire(&mut self, id: &SessionId) {
        if let Some(link) = self.clients.get(id).and_then(|client| client.link) {
            self.sever(link);
        }
        self.close_session(id);
    }

    /// Records the reply to a conversation and sends it.
    fn reply(&mut self, id: &SessionId, cid: ConversationId, frame: ServerFrame) {
        if let Some(client) = self.clients.get_mut(id) {
            client.replies().record(cid, &frame);
        }
        self.deliver(id, frame);
    }

    fn fail(&mut self, id: &SessionId, cid: ConversationId, error: ErrorReport) {
        self.reply(id, cid, ServerFrame::Failed { cid, error });
    }

    fn handle(&mut self, id: &SessionId, frame: ClientFrame) {
        self.purge_expired();

        if let Some(cid) = frame.conversation() {
            let seen = match self.clients.get_mut(id) {
                Some(client) => client.replies().check(cid),
                None => return,
            };
            match seen {
                Seen::New => {}
                Seen::InProgress => {
                    debug!("Session {id} re-sent conversation {cid}, reply pending");
                    return;
                }
                Seen::Answered(reply) => {
                    debug!("Session {id} re-sent conversation {cid}, replaying reply");
                    self.deliver(id, reply);
                    return;
                }
            }
        }

        match frame {
            ClientFrame::AddTopic {
                cid,
                path,
                specification,
            } => self.add_topic(id, cid, path, specification),
            ClientFrame::RemoveTopic { cid, path } => self.remove_topic(id, cid, path),
            ClientFrame::Update { cid, path, value } => self.write(id, cid, path, value, false),
            ClientFrame::Append { cid, path, value } => self.write(id, cid, path, value, true),
            ClientFrame::Fetch { cid, path } => match self.topics.get(&path) {
                Some(topic) => {
                    let value = topic.value.clone();
                    self.reply(id, cid, ServerFrame::Fetched { cid, value });
                }
                None => self.fail(id, cid, ErrorReport::TopicNotFound { path: path.to_string() }),
            },
            ClientFrame::FetchEvents { cid, path } => match self.topics.get(&path) {
                Some(topic) if topic.time_series => {
                    let events = topic.events();
                    self.reply(id, cid, ServerFrame::Events { cid, events });
                }
                Some(_) => self.fail(id, cid, not_time_series(&path)),
                None => self.fail(id, cid, ErrorReport::TopicNotFound { path: path.to_string() }),
            },
            ClientFrame::CreateTopicView {
                cid,
                name,
                specification,
            } => self.create_topic_view(id, cid, name, specification),
            ClientFrame::RemoveTopicView { cid, name } => {
                if self.views.remove(&name).is_some() {
                    info!("Topic view {name} removed by {id}");
                    self.remove_references(|reference| reference.view == name);
                }
                self.reply(id, cid, ServerFrame::Done { cid });
            }
            ClientFrame::ListTopicViews { cid } => {
                let views = self.views.values().map(View::describe).collect();
                self.reply(id, cid, ServerFrame::TopicViews { cid, views });
            }
            ClientFrame::GetTopicView { cid, name } => {
                let view = self.views.get(&name).map(View::describe);
                self.reply(id, cid, ServerFrame::TopicView { cid, view });
            }
            ClientFrame::Subscribe { cid, path } => {
                self.subscriptions
                    .entry(path.clone())
                    .or_default()
                    .insert(id.clone());
                self.reply(id, cid, ServerFrame::Done { cid });
                if let Some(topic) = self.topics.get(&path)
                    && let (Some(value), Some(timestamp)) = (topic.value.clone(), topic.updated_at)
                {
                    self.deliver(
                        id,
                        ServerFrame::Value {
                            path,
                            value,
                            timestamp,
                        },
                    );
                }
            }
            ClientFrame::Unsubscribe { cid, path } => {
                if let Some(subscribers) = self.subscriptions.get_mut(&path) {
                    subscribers.remove(id);
                }
                self.reply(id, cid, ServerFrame::Done { cid });
            }
            ClientFrame::AddRequestHandler { cid, path } => {
                self.handlers.entry(path).or_default().insert(id.clone());
                self.reply(id, cid, ServerFrame::Done { cid });
            }
            ClientFrame::RemoveRequestHandler { cid, path } => {
                if let Some(sessions) = self.handlers.get_mut(&path) {
                    sessions.remove(id);
                }
                self.reply(id, cid, ServerFrame::Done { cid });
            }
            ClientFrame::SendToFilter {
                cid,
                filter,
                path,
                payload,
            } => self.send_to_filter(id, cid, &filter, path, payload),
            ClientFrame::SendToSession {
                cid,
                session_id,
                path,
                payload,
            } => self.send_to_session(id, cid, session_id, path, payload),
            ClientFrame::Respond { request_id, value } => {
                let answer = match value.validate() {
                    Ok(()) => Ok(value),
                    Err(reason) => Err(format!("invalid response: {reason}")),
                };
                self.answer(id, request_id, answer)
            }
            ClientFrame::RespondError {
                request_id,
                message,
            } => self.answer(id, request_id, Err(message)),
            ClientFrame::Open { .. } | ClientFrame::Close => {}
        }
    }

    fn add_topic(
        &mut self,
        id: &SessionId,
        cid: ConversationId,
        path: TopicPath,
        specification: TopicSpecification,
    ) {
        match self.topics.get(&path) {
            Some(existing)
                if existing.reference.is_none() && existing.specification() == specification =>
            {
                self.reply(id, cid, ServerFrame::TopicAdded { cid, created: false });
            }
            Some(_) => self.fail(id, cid, ErrorReport::TopicAlreadyExists { path: path.to_string() }),
            None => {
                info!(
                    "Topic {path} ({}{}) added by {id}",
                    specification.topic_type,
                    if specification.time_series { ", time series" } else { "" }
                );
                self.topics.insert(
                    path.clone(),
                    Topic::with_specification(path.clone(), specification),
                );
                self.reply(id, cid, ServerFrame::TopicAdded { cid, created: true });

                let targets: Vec<(String, TopicPath)> = self
                    .views
                    .values()
                    .filter_map(|view| view.spec.map(&path).map(|target| (view.name.clone(), target)))
                    .collect();
                for (view, target) in targets {
                    self.create_reference(&view, &path, target);
                }
            }
        }
    }

    fn remove_topic(&mut self, id: &SessionId, cid: ConversationId, path: TopicPath) {
        let owner = match self.topics.get(&path) {
            Some(topic) => topic.reference.as_ref().map(|r| r.view.clone()),
            None => {
                self.fail(id, cid, ErrorReport::TopicNotFound { path: path.to_string() });
                return;
            }
        };
        if let Some(view) = owner {
            self.fail(id, cid, maintained_by(&path, &view));
            return;
        }

        self.topics.remove(&path);
        info!("Topic {path} removed by {id}");
        self.remove_references(|reference| reference.source == path);
        self.reply(id, cid, ServerFrame::Done { cid });
    }

    /// Everything that stops a value being written to `path`.
    fn check_write(
        &self,
        path: &TopicPath,
        value: &TopicValue,
        append: bool,
    ) -> std::result::Result<(), ErrorReport> {
        let Some(topic) = self.topics.get(path) else {
            return Err(ErrorReport::TopicNotFound { path: path.to_string() });
        };
        if let Some(reference) = &topic.reference {
            return Err(maintained_by(path, &reference.view));
        }
        if append && !topic.time_series {
            return Err(not_time_series(path));
        }
        if topic.topic_type != value.topic_type() {
            return Err(ErrorReport::TypeMismatch {
                path: path.to_string(),
                expected: topic.topic_type,
                actual: value.topic_type(),
            });
        }
        value.validate().map_err(|reason| ErrorReport::InvalidValue {
            path: path.to_string(),
            reason,
        })
    }

    /// Applies an update or an append, replies, then tells subscribers and
    /// refreshes the reference topics mirroring `path`.
    fn write(
        &mut self,
        id: &SessionId,
        cid: ConversationId,
        path: TopicPath,
        value: TopicValue,
        append: bool,
    ) {
        if let Err(error) = self.check_write(&path, &value, append) {
            self.fail(id, cid, error);
            return;
        }
        let Some(topic) = self.topics.get_mut(&path) else {
            return;
        };
        let timestamp = topic.set(value.clone());
        let reply = match topic.last_event() {
            Some(event) if append => ServerFrame::Appended {
                cid,
                metadata: event.metadata,
            },
            _ => ServerFrame::Done { cid },
        };
        self.reply(id, cid, reply);
        self.fan_out(&path, &value, timestamp);
        self.mirror(&path, &value);
    }

    fn fan_out(&mut self, path: &TopicPath, value: &TopicValue, timestamp: i64) {
        let subscribers: Vec<SessionId> = self
            .subscriptions
            .get(path)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for subscriber in subscribers {
            self.deliver(
                &subscriber,
                ServerFrame::Value {
                    path: path.clone(),
                    value: value.clone(),
                    timestamp,
                },
            );
        }
    }

    /// Copies a new source value into every reference topic derived from it.
    fn mirror(&mut self, source: &TopicPath, value: &TopicValue) {
        let references: Vec<TopicPath> = self
            .topics
            .values()
            .filter(|topic| topic.reference.as_ref().is_some_and(|r| &r.source == source))
            .map(|topic| topic.path.clone())
            .collect();
        for path in references {
            if let Some(topic) = self.topics.get_mut(&path) {
                let timestamp = topic.set(value.clone());
                self.fan_out(&path, value, timestamp);
            }
        }
    }

    fn create_topic_view(
        &mut self,
        id: &SessionId,
        cid: ConversationId,
        name: String,
        specification: String,
    ) {
        let parsed = if name.is_empty() || name.contains(char::is_whitespace) {
            Err("view names are single non-empty words".to_string())
        } else {
            ViewSpec::parse(&specification)
        };
        let spec = match parsed {
            Ok(spec) => spec,
            Err(reason) => {
                self.fail(id, cid, ErrorReport::InvalidTopicView { view: name, reason });
                return;
            }
        };

        // a view created again under the same name replaces the old one
        if self.views.remove(&name).is_some() {
            self.remove_references(|reference| reference.view == name);
        }

        let principal = self
            .clients
            .get(id)
            .map(|client| client.principal.clone())
            .unwrap_or_default();
        let view = View {
            name: name.clone(),
            specification,
            spec,
            roles: BTreeSet::from([principal]),
        };
        let described = view.describe();
        let mapped: Vec<(TopicPath, TopicPath)> = self
            .topics
            .values()
            .filter(|topic| topic.reference.is_none())
            .filter_map(|topic| view.spec.map(&topic.path).map(|target| (topic.path.clone(), target)))
            .collect();
        self.views.insert(name.clone(), view);

        info!("Topic view {name} created by {id}, mapping {} topics", mapped.len());
        for (source, target) in mapped {
            self.create_reference(&name, &source, target);
        }
        self.reply(
            id,
            cid,
            ServerFrame::TopicView {
                cid,
                view: Some(described),
            },
        );
    }

    /// Creates the reference topic `view` derives from `source`. A path that
    /// is already taken keeps its topic.
    fn create_reference(&mut self, view: &str, source: &TopicPath, target: TopicPath) {
        if self.topics.contains_key(&target) {
            debug!("Topic view {view} skips {target}, the path is taken");
            return;
        }
        let Some(origin) = self.topics.get(source).filter(|t| t.reference.is_none()) else {
            return;
        };
        let mut topic = Topic::with_specification(target.clone(), origin.specification());
        topic.reference = Some(Reference {
            view: view.to_string(),
            source: source.clone(),
        });
        let current = origin.value.clone();
        let timestamp = current.clone().map(|value| topic.set(value));
        self.topics.insert(target.clone(), topic);
        debug!("Topic view {view} maps {source} to {target}");

        if let (Some(value), Some(timestamp)) = (current, timestamp) {
            self.fan_out(&target, &value, timestamp);
        }
    }

    fn remove_references(&mut self, matches: impl Fn(&Reference) -> bool) {
        self.topics.retain(|path, topic| {
            let derived = topic.reference.as_ref().is_some_and(&matches);
            if derived {
                debug!("Reference topic {path} removed");
            }
            !derived
        });
    }

    fn send_to_filter(
        &mut self,
        id: &SessionId,
        cid: ConversationId,
        filter: &str,
        path: MessagePath,
        payload: TopicValue,
    ) {
        if let Err(reason) = payload.validate() {
            let error = ErrorReport::InvalidValue {
                path: path.to_string(),
                reason,
            };
            self.fail(id, cid, error);
            return;
        }
        let parsed = match Filter::parse(filter) {
            Ok(parsed) => parsed,
            Err(reason) => {
                let error = ErrorReport::InvalidFilter {
                    filter: filter.to_string(),
                    reason,
                };
                self.fail(id, cid, error);
                return;
            }
        };

        let mut recipients: Vec<SessionId> = self
            .handlers
            .get(&path)
            .into_iter()
            .flatten()
            .filter(|candidate| {
                self.clients.get(*candidate).is_some_and(|client| {
                    parsed.matches(&SessionAttributes {
                        principal: &client.principal,
                        session_id: &client.id,
                    })
                })
            })
            .cloned()
            .collect();
        recipients.sort();

        debug!("Filter '{filter}' from {id} matched {} sessions", recipients.len());
        self.reply(
            id,
            cid,
            ServerFrame::Dispatched {
                cid,
                matched: recipients.len(),
            },
        );
        for recipient in recipients {
            self.forward(id, cid, recipient, RequestKind::Filtered, &path, &payload);
        }
    }

    fn send_to_session(
        &mut self,
        id: &SessionId,
        cid: ConversationId,
        recipient: SessionId,
        path: MessagePath,
        payload: TopicValue,
    ) {
        if let Err(reason) = payload.validate() {
            let error = ErrorReport::InvalidValue {
                path: path.to_string(),
                reason,
            };
            self.fail(id, cid, error);
            return;
        }
        if !self.clients.contains_key(&recipient) {
            let error = ErrorReport::SessionNotFound {
                session_id: recipient.to_string(),
            };
            self.fail(id, cid, error);
            return;
        }
        let handles = self
            .handlers
            .get(&path)
            .is_some_and(|sessions| sessions.contains(&recipient));
        if !handles {
            self.fail(id, cid, ErrorReport::NoHandler { path: path.to_string() });
            return;
        }
        self.forward(id, cid, recipient, RequestKind::Direct, &path, &payload);
    }

    fn forward(
        &mut self,
        requester: &SessionId,
        cid: ConversationId,
        recipient: SessionId,
        kind: RequestKind,
        path: &MessagePath,
        payload: &TopicValue,
    ) {
        let request_id = self.next_request;
        self.next_request += 1;
        self.requests.insert(
            request_id,
            InFlight {
                requester: requester.clone(),
                cid,
                recipient: recipient.clone(),
                kind,
            },
        );
        self.deliver(
            &recipient,
            ServerFrame::Request {
                request_id,
                from: requester.clone(),
                path: path.clone(),
                payload: payload.clone(),
            },
        );
    }

    fn answer(
        &mut self,
        id: &SessionId,
        request_id: RequestId,
        answer: std::result::Result<TopicValue, String>,
    ) {
        match self.requests.get(&request_id) {
            Some(request) if &request.recipient == id => {}
            Some(_) => {
                warn!("Session {id} answered request {request_id} it did not receive");
                return;
            }
            None => {
                debug!("Answer to unknown request {request_id} from {id}");
                return;
            }
        }
        if let Some(request) = self.requests.remove(&request_id) {
            self.settle(request, answer);
        }
    }

    fn settle(&mut self, request: InFlight, answer: std::result::Result<TopicValue, String>) {
        let InFlight {
            requester,
            cid,
            recipient,
            kind,
        } = request;
        match (kind, answer) {
            (RequestKind::Filtered, Ok(value)) => self.deliver(
                &requester,
                ServerFrame::FilterResponse {
                    cid,
                    from: recipient,
                    value,
                },
            ),
            (RequestKind::Filtered, Err(message)) => self.deliver(
                &requester,
                ServerFrame::FilterResponseError {
                    cid,
                    from: recipient,
                    message,
                },
            ),
            (RequestKind::Direct, Ok(value)) => {
                self.reply(&requester, cid, ServerFrame::Response { cid, value })
            }
            (RequestKind::Direct, Err(message)) => {
                self.fail(&requester, cid, ErrorReport::RequestFailed { message })
            }
        }
    }

    /// Removes a session and everything it registered. Requests it had not
    /// answered yet are answered with an error. Topic views outlive the
    /// session that created them.
    fn close_session(&mut self, id: &SessionId) {
        if self.clients.remove(id).is_none() {
            return;
        }
        for subscribers in self.subscriptions.values_mut() {
            subscribers.remove(id);
        }
        for sessions in self.handlers.values_mut() {
            sessions.remove(id);
        }

        let stranded: Vec<RequestId> = self
            .requests
            .iter()
            .filter(|(_, request)| &request.recipient == id || &request.requester == id)
            .map(|(request_id, _)| *request_id)
            .collect();
        for request_id in stranded {
            if let Some(request) = self.requests.remove(&request_id)
                && &request.requester != id
            {
                self.settle(request, Err(format!("session {id} closed before responding")));
            }
        }
        debug!("Cleaned up session {id}");
    }

    fn purge_expired(&mut self) {
        let retention = self.retention;
        let expired: Vec<SessionId> = self
            .clients
            .values()
            .filter(|client| {
                client
                    .detached_at
                    .is_some_and(|since| since.elapsed() >= retention)
            })
            .map(|client| client.id.clone())
            .collect();
        for id in expired {
            info!("Session {id} expired");
            self.close_session(&id);
        }
    }
}

fn not_time_series(path: &TopicPath) -> ErrorReport {
    ErrorReport::IncompatibleTopic {
        path: path.to_string(),
        reason: "not a time series topic".to_string(),
    }
}

fn maintained_by(path: &TopicPath, view: &str) -> ErrorReport {
    ErrorReport::IncompatibleTopic {
        path: path.to_string(),
        reason: format!("maintained by topic view '{view}'"),
    }
}
