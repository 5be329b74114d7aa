//! Topic and messaging path validation.
//!
//! Topic paths are `/`-separated segments with no empty segment, so leading
//! and trailing slashes are rejected. Messaging paths may carry a leading `>`
//! which marks a request/response endpoint rather than a stored topic.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::utils::error::{Result, SessionError};

/// Marker that distinguishes messaging endpoints from stored topics.
pub const MESSAGING_PREFIX: char = '>';

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicPath(String);

impl TopicPath {
    pub fn parse(path: &str) -> Result<Self> {
        if path.starts_with(MESSAGING_PREFIX) {
            return Err(invalid(path, "'>' is reserved for messaging paths"));
        }
        check_segments(path)?;
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for TopicPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Path of a request/response endpoint, e.g. `>random/requestResponse`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessagePath(String);

impl MessagePath {
    pub fn parse(path: &str) -> Result<Self> {
        let body = path.strip_prefix(MESSAGING_PREFIX).unwrap_or(path);
        check_segments(body).map_err(|_| invalid(path, "malformed messaging path"))?;
        Ok(Self(path.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessagePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn check_segments(path: &str) -> Result<()> {
    if path.trim().is_empty() {
        return Err(invalid(path, "path is empty"));
    }
    if path.split('/').any(|segment| segment.is_empty()) {
        return Err(invalid(path, "empty path segment"));
    }
    if path.chars().any(char::is_control) {
        return Err(invalid(path, "control characters are not allowed"));
    }
    Ok(())
}

fn invalid(path: &str, reason: &str) -> SessionError {
    SessionError::InvalidPath {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
