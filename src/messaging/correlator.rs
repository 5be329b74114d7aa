//! Filtered request correlator
//!
//! Tracks every open filtered-request stream of a session. A stream is opened
//! when the broker reports how many recipients matched the filter, receives
//! one answer per recipient, and is retired with exactly one `Closed` event:
//! - when every matched recipient has answered (`Complete`);
//! - when the session loses its broker-side identity (`SessionLost`);
//! - when the session closes (`SessionClosed`).
//!
//! Duplicate answers from a recipient and answers for retired streams are
//! dropped, so a consumer never sees a second answer or anything after
//! `Closed`.

use std::collections::{HashMap, HashSet};

use tokio::sync::mpsc;
use tracing::debug;

use crate::messaging::{CloseReason, FilteredEvent};
use crate::topic::TopicValue;
use crate::transport::{ConversationId, SessionId};

#[derive(Debug)]
struct OpenStream {
    expected: usize,
    answered: HashSet<SessionId>,
    events: mpsc::UnboundedSender<FilteredEvent>,
}

#[derive(Debug, Default)]
pub struct Correlator {
    streams: HashMap<ConversationId, OpenStream>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track the answers to conversation `cid`, expecting `expected` of them.
    /// With none expected the stream closes straight away.
    pub fn open(
        &mut self,
        cid: ConversationId,
        expected: usize,
        events: mpsc::UnboundedSender<FilteredEvent>,
    ) {
        if expected == 0 {
            let _ = events.send(FilteredEvent::Closed(CloseReason::Complete));
            return;
        }
        self.streams.insert(
            cid,
            OpenStream {
                expected,
                answered: HashSet::new(),
                events,
            },
        );
    }

    /// Route one recipient's answer. Returns `false` if it was dropped.
    pub fn deliver(
        &mut self,
        cid: ConversationId,
        from: SessionId,
        answer: Result<TopicValue, String>,
    ) -> bool {
        let Some(stream) = self.streams.get_mut(&cid) else {
            debug!("Dropping answer for retired request {cid} from {from}");
            return false;
        };
        if stream.answered.contains(&from) {
            debug!("Dropping duplicate answer for request {cid} from {from}");
            return false;
        }
        if stream.answered.len() >= stream.expected {
            return false;
        }
        stream.answered.insert(from.clone());

        let event = match answer {
            Ok(value) => FilteredEvent::Response {
                session_id: from,
                value,
            },
            Err(message) => FilteredEvent::ResponseError {
                session_id: from,
                message,
            },
        };

        if stream.events.send(event).is_err() {
            // consumer is gone, nobody will read the rest
            self.streams.remove(&cid);
            return false;
        }

        if stream.answered.len() >= stream.expected {
            self.retire(cid, CloseReason::Complete);
        }
        true
    }

    /// Close one stream early, reporting `reason`.
    pub fn retire(&mut self, cid: ConversationId, reason: CloseReason) {
        if let Some(stream) = self.streams.remove(&cid) {
            let _ = stream.events.send(FilteredEvent::Closed(reason));
        }
    }

    /// Close every open stream.
    pub fn retire_all(&mut self, reason: CloseReason) {
        for (_, stream) in self.streams.drain() {
            let _ = stream.events.send(FilteredEvent::Closed(reason));
        }
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
