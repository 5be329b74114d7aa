//! Incoming requests for a session's request handlers.
//!
//! Every request must be answered exactly once. `Responder::respond` and
//! `Responder::reject` consume the responder; dropping it unanswered sends an
//! error response so the requester is never left waiting. A responder does
//! not keep its session alive: once every `Session` handle is gone, answering
//! fails with `SessionNotConnected`.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::session::command::Command;
use crate::topic::{MessagePath, TopicValue};
use crate::transport::{RequestId, SessionId};
use crate::utils::error::{Result, SessionError};

#[derive(Debug)]
pub struct IncomingRequest {
    pub from: SessionId,
    pub path: MessagePath,
    pub payload: TopicValue,
    pub responder: Responder,
}

impl IncomingRequest {
    /// Answer the request, see `Responder::respond`.
    pub fn respond(self, value: impl Into<TopicValue>) -> Result<()> {
        self.responder.respond(value)
    }

    /// Answer with an error message.
    pub fn reject(self, message: impl Into<String>) -> Result<()> {
        self.responder.reject(message)
    }
}

#[derive(Debug)]
pub struct Responder {
    request_id: RequestId,
    path: MessagePath,
    commands: Option<mpsc::WeakUnboundedSender<Command>>,
}

impl Responder {
    pub(crate) fn new(
        request_id: RequestId,
        path: MessagePath,
        commands: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            request_id,
            path,
            commands: Some(commands),
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Answer with `value`. A non-finite double fails with `InvalidValue`
    /// and the requester gets an error response instead.
    pub fn respond(mut self, value: impl Into<TopicValue>) -> Result<()> {
        let value = value.into();
        SessionError::check_value(self.path.as_str(), &value)?;
        self.finish(Ok(value))
    }

    /// Answer with an error message.
    pub fn reject(mut self, message: impl Into<String>) -> Result<()> {
        self.finish(Err(message.into()))
    }

    fn finish(&mut self, result: std::result::Result<TopicValue, String>) -> Result<()> {
        let commands = self
            .commands
            .take()
            .and_then(|weak| weak.upgrade())
            .ok_or(SessionError::SessionNotConnected)?;
        commands
            .send(Command::Respond {
                request_id: self.request_id,
                result,
            })
            .map_err(|_| SessionError::SessionNotConnected)
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        if self.commands.is_some() {
            let _ = self.finish(Err("request dropped without a response".to_string()));
        }
    }
}

/// Requests arriving on one messaging path. Ends when the handler is removed
/// or the session closes.
#[derive(Debug)]
pub struct RequestStream {
    path: MessagePath,
    requests: mpsc::UnboundedReceiver<IncomingRequest>,
}

impl RequestStream {
    pub(crate) fn new(path: MessagePath, requests: mpsc::UnboundedReceiver<IncomingRequest>) -> Self {
        Self { path, requests }
    }

    pub fn path(&self) -> &MessagePath {
        &self.path
    }

    /// Next request, `None` once the handler is gone.
    pub async fn recv(&mut self) -> Option<IncomingRequest> {
        self.requests.recv().await
    }
}

impl Stream for RequestStream {
    type Item = IncomingRequest;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.requests.poll_recv(cx)
    }
}
