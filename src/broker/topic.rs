use std::collections::VecDeque;

use crate::topic::series::RETAINED_EVENTS;
use crate::topic::{
    EventMetadata, TimeSeriesEvent, TopicPath, TopicSpecification, TopicType, TopicValue,
};

/// Where a reference topic gets its values from.
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub view: String,
    pub source: TopicPath,
}

/// A topic held by the broker: its declared type and latest value.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub path: TopicPath,
    pub topic_type: TopicType,
    pub time_series: bool,
    pub value: Option<TopicValue>,
    /// Milliseconds since the UNIX epoch of the last update.
    pub updated_at: Option<i64>,
    /// Set when a topic view maintains this topic.
    pub reference: Option<Reference>,
    events: VecDeque<TimeSeriesEvent>,
    next_sequence: u64,
}

impl Topic {
    /// Creates a plain topic with no value yet.
    pub fn new(path: TopicPath, topic_type: TopicType) -> Self {
        Self::with_specification(path, TopicSpecification::new(topic_type))
    }

    pub fn with_specification(path: TopicPath, specification: TopicSpecification) -> Self {
        Self {
            path,
            topic_type: specification.topic_type,
            time_series: specification.time_series,
            value: None,
            updated_at: None,
            reference: None,
            events: VecDeque::new(),
            next_sequence: 0,
        }
    }

    pub fn specification(&self) -> TopicSpecification {
        TopicSpecification {
            topic_type: self.topic_type,
            time_series: self.time_series,
        }
    }

    /// Replaces the value, stamping it with the current time. Time series
    /// topics also record it as a new event. The caller has already checked
    /// the type.
    pub fn set(&mut self, value: TopicValue) -> i64 {
        let timestamp = chrono::Utc::now().timestamp_millis();
        if self.time_series {
            let metadata = EventMetadata {
                sequence: self.next_sequence,
                timestamp,
            };
            self.next_sequence += 1;
            if self.events.len() >= RETAINED_EVENTS {
                self.events.pop_front();
            }
            self.events.push_back(TimeSeriesEvent {
                metadata,
                value: value.clone(),
            });
        }
        self.value = Some(value);
        self.updated_at = Some(timestamp);
        timestamp
    }

    /// The event recorded by the last `set` on a time series topic.
    pub fn last_event(&self) -> Option<&TimeSeriesEvent> {
        self.events.back()
    }

    /// Retained events, oldest first.
    pub fn events(&self) -> Vec<TimeSeriesEvent> {
        self.events.iter().cloned().collect()
    }
}
