//! The `topic` module holds everything a session needs to know about topics:
//! path validation, the typed value model, time series events, topic views,
//! the per-session registry of added topics, and the subscription value stream.

pub mod path;
pub mod registry;
pub mod series;
pub mod stream;
pub mod value;
pub mod view;

use serde::{Deserialize, Serialize};

pub use path::{MessagePath, TopicPath};
pub use registry::TopicRegistry;
pub use series::{EventMetadata, TimeSeriesEvent};
pub use stream::{TopicEvent, ValueStream};
pub use value::{TopicType, TopicValue};
pub use view::TopicView;

/// What `add_topic` creates. A plain `TopicType` converts into a
/// specification for a topic that only keeps its latest value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TopicSpecification {
    pub topic_type: TopicType,
    /// Also keep recent events, see `series`.
    #[serde(default)]
    pub time_series: bool,
}

impl TopicSpecification {
    pub fn new(topic_type: TopicType) -> Self {
        Self {
            topic_type,
            time_series: false,
        }
    }

    /// A time series topic whose events hold `event_type` values.
    pub fn time_series(event_type: TopicType) -> Self {
        Self {
            topic_type: event_type,
            time_series: true,
        }
    }
}

impl From<TopicType> for TopicSpecification {
    fn from(topic_type: TopicType) -> Self {
        Self::new(topic_type)
    }
}

/// Outcome of a successful `add_topic`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddTopicResult {
    /// The topic did not exist and was created.
    Created,
    /// A topic with the same path and type already existed.
    Exists,
}
