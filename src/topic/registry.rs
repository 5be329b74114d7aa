//! Topic registry
//!
//! The registry records every topic this session has successfully added,
//! together with its specification, and every topic view it created. It
//! serves two purposes:
//! - local checks, so an update with the wrong value type or an append to a
//!   plain topic fails before any round trip to the broker;
//! - the command log replayed after a reconnection in which the broker did
//!   not resume the session.
//!
//! The registry is owned by the session driver task and never shared.

use std::collections::BTreeMap;

use crate::topic::{TopicPath, TopicSpecification, TopicType, TopicValue};
use crate::utils::error::{Result, SessionError};

#[derive(Debug, Default)]
pub struct TopicRegistry {
    topics: BTreeMap<TopicPath, TopicSpecification>,
    views: BTreeMap<String, String>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a topic. Re-registering an existing path overwrites its
    /// specification.
    pub fn insert(&mut self, path: TopicPath, specification: impl Into<TopicSpecification>) {
        self.topics.insert(path, specification.into());
    }

    /// Forget a topic, returning its specification.
    pub fn remove(&mut self, path: &TopicPath) -> Option<TopicSpecification> {
        self.topics.remove(path)
    }

    pub fn specification(&self, path: &TopicPath) -> Option<TopicSpecification> {
        self.topics.get(path).copied()
    }

    pub fn declared_type(&self, path: &TopicPath) -> Option<TopicType> {
        self.specification(path).map(|spec| spec.topic_type)
    }

    /// Check `value` against the declared type of `path`. Topics this session
    /// did not add are left for the broker to check.
    pub fn check(&self, path: &TopicPath, value: &TopicValue) -> Result<()> {
        match self.declared_type(path) {
            Some(expected) if expected != value.topic_type() => Err(SessionError::TypeMismatch {
                path: path.to_string(),
                expected,
                actual: value.topic_type(),
            }),
            _ => Ok(()),
        }
    }

    /// Like `check`, and also refuses appends to plain topics of this session.
    pub fn check_append(&self, path: &TopicPath, value: &TopicValue) -> Result<()> {
        if self.specification(path).is_some_and(|spec| !spec.time_series) {
            return Err(SessionError::IncompatibleTopic {
                path: path.to_string(),
                reason: "not a time series topic".to_string(),
            });
        }
        self.check(path, value)
    }

    /// Topics in path order.
    pub fn iter(&self) -> impl Iterator<Item = (&TopicPath, TopicSpecification)> {
        self.topics.iter().map(|(path, spec)| (path, *spec))
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Record a topic view created by this session.
    pub fn insert_view(&mut self, name: String, specification: String) {
        self.views.insert(name, specification);
    }

    /// Forget a view, returning its specification.
    pub fn remove_view(&mut self, name: &str) -> Option<String> {
        self.views.remove(name)
    }

    /// Views by name, with their specifications.
    pub fn views(&self) -> impl Iterator<Item = (&str, &str)> {
        self.views
            .iter()
            .map(|(name, spec)| (name.as_str(), spec.as_str()))
    }
}
