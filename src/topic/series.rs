//! Time series topics.
//!
//! A time series topic keeps its latest value like any other topic, and also
//! the most recent events appended to it. Every event gets a sequence number
//! that increases by one per append and is never reused.

use serde::{Deserialize, Serialize};

use crate::topic::TopicValue;

/// Events a time series topic retains. Older events are discarded first.
pub const RETAINED_EVENTS: usize = 10;

/// Position of an event in its time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub sequence: u64,
    /// Milliseconds since the UNIX epoch.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesEvent {
    pub metadata: EventMetadata,
    pub value: TopicValue,
}
