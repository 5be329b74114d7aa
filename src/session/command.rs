//! Messages from `Session` handles (and responders) to the driver task.

use tokio::sync::{mpsc, oneshot};

use crate::messaging::{FilteredEvent, IncomingRequest};
use crate::topic::{
    AddTopicResult, EventMetadata, MessagePath, TimeSeriesEvent, TopicEvent, TopicPath,
    TopicSpecification, TopicValue, TopicView,
};
use crate::transport::{ClientFrame, ConversationId, RequestId, SessionId};
use crate::utils::error::Result;

#[derive(Debug)]
pub enum Command {
    Call {
        op: Operation,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Respond {
        request_id: RequestId,
        result: std::result::Result<TopicValue, String>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

#[derive(Debug)]
pub enum Operation {
    AddTopic {
        path: TopicPath,
        specification: TopicSpecification,
    },
    RemoveTopic {
        path: TopicPath,
    },
    Update {
        path: TopicPath,
        value: TopicValue,
    },
    Fetch {
        path: TopicPath,
    },
    Append {
        path: TopicPath,
        value: TopicValue,
    },
    FetchEvents {
        path: TopicPath,
    },
    CreateTopicView {
        name: String,
        specification: String,
    },
    RemoveTopicView {
        name: String,
    },
    ListTopicViews,
    GetTopicView {
        name: String,
    },
    Subscribe {
        path: TopicPath,
        events: mpsc::UnboundedSender<TopicEvent>,
    },
    Unsubscribe {
        path: TopicPath,
    },
    AddRequestHandler {
        path: MessagePath,
        requests: mpsc::UnboundedSender<IncomingRequest>,
    },
    RemoveRequestHandler {
        path: MessagePath,
    },
    SendToFilter {
        filter: String,
        path: MessagePath,
        payload: TopicValue,
        events: mpsc::UnboundedSender<FilteredEvent>,
    },
    SendToSession {
        session_id: SessionId,
        path: MessagePath,
        payload: TopicValue,
    },
}

impl Operation {
    /// Wire frame for this operation under conversation `cid`.
    pub fn frame(&self, cid: ConversationId) -> ClientFrame {
        match self {
            Operation::AddTopic {
                path,
                specification,
            } => ClientFrame::AddTopic {
                cid,
                path: path.clone(),
                specification: *specification,
            },
            Operation::RemoveTopic { path } => ClientFrame::RemoveTopic {
                cid,
                path: path.clone(),
            },
            Operation::Update { path, value } => ClientFrame::Update {
                cid,
                path: path.clone(),
                value: value.clone(),
            },
            Operation::Fetch { path } => ClientFrame::Fetch {
                cid,
                path: path.clone(),
            },
            Operation::Append { path, value } => ClientFrame::Append {
                cid,
                path: path.clone(),
                value: value.clone(),
            },
            Operation::FetchEvents { path } => ClientFrame::FetchEvents {
                cid,
                path: path.clone(),
            },
            Operation::CreateTopicView {
                name,
                specification,
            } => ClientFrame::CreateTopicView {
                cid,
                name: name.clone(),
                specification: specification.clone(),
            },
            Operation::RemoveTopicView { name } => ClientFrame::RemoveTopicView {
                cid,
                name: name.clone(),
            },
            Operation::ListTopicViews => ClientFrame::ListTopicViews { cid },
            Operation::GetTopicView { name } => ClientFrame::GetTopicView {
                cid,
                name: name.clone(),
            },
            Operation::Subscribe { path, .. } => ClientFrame::Subscribe {
                cid,
                path: path.clone(),
            },
            Operation::Unsubscribe { path } => ClientFrame::Unsubscribe {
                cid,
                path: path.clone(),
            },
            Operation::AddRequestHandler { path, .. } => ClientFrame::AddRequestHandler {
                cid,
                path: path.clone(),
            },
            Operation::RemoveRequestHandler { path } => ClientFrame::RemoveRequestHandler {
                cid,
                path: path.clone(),
            },
            Operation::SendToFilter {
                filter,
                path,
                payload,
                ..
            } => ClientFrame::SendToFilter {
                cid,
                filter: filter.clone(),
                path: path.clone(),
                payload: payload.clone(),
            },
            Operation::SendToSession {
                session_id,
                path,
                payload,
            } => ClientFrame::SendToSession {
                cid,
                session_id: session_id.clone(),
                path: path.clone(),
                payload: payload.clone(),
            },
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Operation::AddTopic { .. } => "add_topic",
            Operation::RemoveTopic { .. } => "remove_topic",
            Operation::Update { .. } => "update",
            Operation::Fetch { .. } => "fetch",
            Operation::Append { .. } => "append",
            Operation::FetchEvents { .. } => "fetch_events",
            Operation::CreateTopicView { .. } => "create_topic_view",
            Operation::RemoveTopicView { .. } => "remove_topic_view",
            Operation::ListTopicViews => "list_topic_views",
            Operation::GetTopicView { .. } => "get_topic_view",
            Operation::Subscribe { .. } => "subscribe",
            Operation::Unsubscribe { .. } => "unsubscribe",
            Operation::AddRequestHandler { .. } => "add_request_handler",
            Operation::RemoveRequestHandler { .. } => "remove_request_handler",
            Operation::SendToFilter { .. } => "send_to_filter",
            Operation::SendToSession { .. } => "send_to_session",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Added(AddTopicResult),
    Done,
    Fetched(Option<TopicValue>),
    Appended(EventMetadata),
    Events(Vec<TimeSeriesEvent>),
    View(Option<TopicView>),
    Views(Vec<TopicView>),
    Dispatched(usize),
    Response(TopicValue),
}
