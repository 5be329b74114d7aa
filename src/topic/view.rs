use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A named topic view as reported by the broker.
///
/// The view maintains reference topics mirroring its source topics, following
/// a specification such as `map sensors/temperature to views/temperature`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicView {
    pub name: String,
    pub specification: String,
    /// Principals whose permissions the view was evaluated with.
    pub roles: BTreeSet<String>,
}
