//! Subscription value streams.
//!
//! Each subscription delivers `TopicEvent`s carrying both the new value and
//! the value previously seen on this stream (`None` for the first event).

use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::topic::{TopicPath, TopicValue};

#[derive(Debug, Clone, PartialEq)]
pub struct TopicEvent {
    pub path: TopicPath,
    pub old_value: Option<TopicValue>,
    pub new_value: TopicValue,
    /// Milliseconds since the UNIX epoch, set by the broker on update.
    pub timestamp: i64,
}

/// Receiving side of a subscription. Ends when the subscription is removed or
/// the session closes.
#[derive(Debug)]
pub struct ValueStream {
    path: TopicPath,
    events: mpsc::UnboundedReceiver<TopicEvent>,
}

impl ValueStream {
    pub(crate) fn new(path: TopicPath, events: mpsc::UnboundedReceiver<TopicEvent>) -> Self {
        Self { path, events }
    }

    pub fn path(&self) -> &TopicPath {
        &self.path
    }

    pub async fn recv(&mut self) -> Option<TopicEvent> {
        self.events.recv().await
    }
}

impl Stream for ValueStream {
    type Item = TopicEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

/// Driver-side state of one subscription.
#[derive(Debug)]
pub(crate) struct Subscription {
    events: mpsc::UnboundedSender<TopicEvent>,
    last: Option<TopicValue>,
}

impl Subscription {
    pub(crate) fn new(events: mpsc::UnboundedSender<TopicEvent>) -> Self {
        Self { events, last: None }
    }

    /// Returns `false` once the consumer has dropped its `ValueStream`.
    pub(crate) fn deliver(&mut self, path: &TopicPath, value: TopicValue, timestamp: i64) -> bool {
        let event = TopicEvent {
            path: path.clone(),
            old_value: self.last.replace(value.clone()),
            new_value: value,
            timestamp,
        };
        self.events.send(event).is_ok()
    }
}
