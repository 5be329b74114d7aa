//! The `messaging` module covers request/response traffic between sessions.
//!
//! A filtered request is sent once and fanned out by the broker to every
//! session whose attributes match the filter expression and which has a
//! handler on the destination path. The caller gets back a
//! `FilteredResponses` handle: a finite stream of per-recipient answers
//! followed by exactly one `Closed` event.

pub mod correlator;
pub mod request;

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::topic::TopicValue;
use crate::transport::SessionId;

pub use correlator::Correlator;
pub use request::{IncomingRequest, RequestStream, Responder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Every matched recipient answered.
    Complete,
    /// The broker no longer knows this session, so outstanding answers can
    /// never arrive.
    SessionLost,
    /// The session was closed.
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FilteredEvent {
    Response {
        session_id: SessionId,
        value: TopicValue,
    },
    ResponseError {
        session_id: SessionId,
        message: String,
    },
    Closed(CloseReason),
}

/// Handle on an in-flight filtered request.
#[derive(Debug)]
pub struct FilteredResponses {
    matched: usize,
    events: mpsc::UnboundedReceiver<FilteredEvent>,
    closed: bool,
}

impl FilteredResponses {
    pub(crate) fn new(matched: usize, events: mpsc::UnboundedReceiver<FilteredEvent>) -> Self {
        Self {
            matched,
            events,
            closed: false,
        }
    }

    /// Number of sessions the request was dispatched to.
    pub fn matched(&self) -> usize {
        self.matched
    }

    /// Next event. Returns `None` after `Closed` has been yielded.
    pub async fn next_event(&mut self) -> Option<FilteredEvent> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    /// Drain the stream, returning the answers in arrival order and the
    /// reason it closed.
    pub async fn collect_all(mut self) -> (Vec<FilteredEvent>, CloseReason) {
        let mut answers = Vec::new();
        while let Some(event) = self.next_event().await {
            match event {
                FilteredEvent::Closed(reason) => return (answers, reason),
                other => answers.push(other),
            }
        }
        (answers, CloseReason::SessionClosed)
    }

    fn poll_event(&mut self, cx: &mut Context<'_>) -> Poll<Option<FilteredEvent>> {
        if self.closed {
            return Poll::Ready(None);
        }
        match self.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if matches!(event, FilteredEvent::Closed(_)) {
                    self.closed = true;
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                // driver dropped the stream without a close event
                self.closed = true;
                Poll::Ready(Some(FilteredEvent::Closed(CloseReason::SessionClosed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Stream for FilteredResponses {
    type Item = FilteredEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_event(cx)
    }
}

#[cfg(test)]
mod tests;
