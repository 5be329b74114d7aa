//! Frame vocabulary exchanged between a session and a broker.
//!
//! Frames are JSON objects tagged by `type`. Every round trip carries a
//! conversation id (`cid`) chosen by the session; the broker echoes it in the
//! reply and uses it to recognise frames re-sent after a reconnection.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::topic::{
    EventMetadata, MessagePath, TimeSeriesEvent, TopicPath, TopicSpecification, TopicType,
    TopicValue, TopicView,
};

pub type ConversationId = u64;
pub type RequestId = u64;

/// Broker-assigned identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Open {
        principal: String,
        password: String,
        resume: Option<SessionId>,
    },
    AddTopic {
        cid: ConversationId,
        path: TopicPath,
        specification: TopicSpecification,
    },
    RemoveTopic {
        cid: ConversationId,
        path: TopicPath,
    },
    Update {
        cid: ConversationId,
        path: TopicPath,
        value: TopicValue,
    },
    Fetch {
        cid: ConversationId,
        path: TopicPath,
    },
    Append {
        cid: ConversationId,
        path: TopicPath,
        value: TopicValue,
    },
    FetchEvents {
        cid: ConversationId,
        path: TopicPath,
    },
    CreateTopicView {
        cid: ConversationId,
        name: String,
        specification: String,
    },
    RemoveTopicView {
        cid: ConversationId,
        name: String,
    },
    ListTopicViews {
        cid: ConversationId,
    },
    GetTopicView {
        cid: ConversationId,
        name: String,
    },
    Subscribe {
        cid: ConversationId,
        path: TopicPath,
    },
    Unsubscribe {
        cid: ConversationId,
        path: TopicPath,
    },
    AddRequestHandler {
        cid: ConversationId,
        path: MessagePath,
    },
    RemoveRequestHandler {
        cid: ConversationId,
        path: MessagePath,
    },
    SendToFilter {
        cid: ConversationId,
        filter: String,
        path: MessagePath,
        payload: TopicValue,
    },
    SendToSession {
        cid: ConversationId,
        session_id: SessionId,
        path: MessagePath,
        payload: TopicValue,
    },
    Respond {
        request_id: RequestId,
        value: TopicValue,
    },
    RespondError {
        request_id: RequestId,
        message: String,
    },
    Close,
}

impl ClientFrame {
    pub fn conversation(&self) -> Option<ConversationId> {
        match self {
            ClientFrame::AddTopic { cid, .. }
            | ClientFrame::RemoveTopic { cid, .. }
            | ClientFrame::Update { cid, .. }
            | ClientFrame::Fetch { cid, .. }
            | ClientFrame::Append { cid, .. }
            | ClientFrame::FetchEvents { cid, .. }
            | ClientFrame::CreateTopicView { cid, .. }
            | ClientFrame::RemoveTopicView { cid, .. }
            | ClientFrame::ListTopicViews { cid }
            | ClientFrame::GetTopicView { cid, .. }
            | ClientFrame::Subscribe { cid, .. }
            | ClientFrame::Unsubscribe { cid, .. }
            | ClientFrame::AddRequestHandler { cid, .. }
            | ClientFrame::RemoveRequestHandler { cid, .. }
            | ClientFrame::SendToFilter { cid, .. }
            | ClientFrame::SendToSession { cid, .. } => Some(*cid),
            ClientFrame::Open { .. }
            | ClientFrame::Respond { .. }
            | ClientFrame::RespondError { .. }
            | ClientFrame::Close => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Opened {
        session_id: SessionId,
        resumed: bool,
    },
    Rejected {
        message: String,
    },
    Done {
        cid: ConversationId,
    },
    TopicAdded {
        cid: ConversationId,
        created: bool,
    },
    Fetched {
        cid: ConversationId,
        value: Option<TopicValue>,
    },
    Appended {
        cid: ConversationId,
        metadata: EventMetadata,
    },
    Events {
        cid: ConversationId,
        events: Vec<TimeSeriesEvent>,
    },
    TopicView {
        cid: ConversationId,
        view: Option<TopicView>,
    },
    TopicViews {
        cid: ConversationId,
        views: Vec<TopicView>,
    },
    Dispatched {
        cid: ConversationId,
        matched: usize,
    },
    Response {
        cid: ConversationId,
        value: TopicValue,
    },
    Failed {
        cid: ConversationId,
        error: ErrorReport,
    },
    FilterResponse {
        cid: ConversationId,
        from: SessionId,
        value: TopicValue,
    },
    FilterResponseError {
        cid: ConversationId,
        from: SessionId,
        message: String,
    },
    Request {
        request_id: RequestId,
        from: SessionId,
        path: MessagePath,
        payload: TopicValue,
    },
    Value {
        path: TopicPath,
        value: TopicValue,
        timestamp: i64,
    },
}

impl ServerFrame {
    /// Conversation id of a round-trip reply. Filter responses are excluded:
    /// they belong to a stream, not to the request's single reply.
    pub fn reply_to(&self) -> Option<ConversationId> {
        match self {
            ServerFrame::Done { cid }
            | ServerFrame::TopicAdded { cid, .. }
            | ServerFrame::Fetched { cid, .. }
            | ServerFrame::Appended { cid, .. }
            | ServerFrame::Events { cid, .. }
            | ServerFrame::TopicView { cid, .. }
            | ServerFrame::TopicViews { cid, .. }
            | ServerFrame::Dispatched { cid, .. }
            | ServerFrame::Response { cid, .. }
            | ServerFrame::Failed { cid, .. } => Some(*cid),
            _ => None,
        }
    }
}

/// Typed failure carried by `ServerFrame::Failed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code", rename_all = "snake_case")]
pub enum ErrorReport {
    TopicAlreadyExists {
        path: String,
    },
    TopicNotFound {
        path: String,
    },
    InvalidPath {
        path: String,
        reason: String,
    },
    TypeMismatch {
        path: String,
        expected: TopicType,
        actual: TopicType,
    },
    InvalidValue {
        path: String,
        reason: String,
    },
    IncompatibleTopic {
        path: String,
        reason: String,
    },
    InvalidFilter {
        filter: String,
        reason: String,
    },
    InvalidTopicView {
        view: String,
        reason: String,
    },
    SessionNotFound {
        session_id: String,
    },
    NoHandler {
        path: String,
    },
    RequestFailed {
        message: String,
    },
    Rejected {
        message: String,
    },
}
