//! The `error` module defines the error type returned by every fallible
//! session operation.
//!
//! Transport faults never show up here directly: a lost connection is turned
//! into a session state transition and only surfaces as `Timeout` or
//! `SessionNotConnected` once recovery has given up or the caller closed the
//! session.

use thiserror::Error;

use crate::topic::TopicType;
use crate::transport::message::ErrorReport;

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("could not connect: {message}")]
    Connection { message: String },
    #[error("connection lost")]
    ConnectionLost,
    #[error("session is not connected")]
    SessionNotConnected,
    #[error("topic '{0}' already exists with a different type")]
    TopicAlreadyExists(String),
    #[error("topic '{0}' not found")]
    TopicNotFound(String),
    #[error("invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },
    #[error("topic '{path}' holds {expected} values, got {actual}")]
    TypeMismatch {
        path: String,
        expected: TopicType,
        actual: TopicType,
    },
    #[error("invalid value for '{path}': {reason}")]
    InvalidValue { path: String, reason: String },
    #[error("topic '{path}' does not support this operation: {reason}")]
    IncompatibleTopic { path: String, reason: String },
    #[error("invalid filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },
    #[error("invalid topic view '{view}': {reason}")]
    InvalidTopicView { view: String, reason: String },
    #[error("reconnection timed out")]
    Timeout,
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("request failed: {0}")]
    RequestFailed(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl SessionError {
    /// `InvalidValue` for `path` unless `value` can be sent.
    pub fn check_value(path: &str, value: &crate::topic::TopicValue) -> Result<()> {
        value.validate().map_err(|reason| Self::InvalidValue {
            path: path.to_string(),
            reason,
        })
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Errors that may go away if the operation is retried on a healthy session.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ConnectionLost | Self::SessionNotConnected
        )
    }
}

impl From<ErrorReport> for SessionError {
    fn from(report: ErrorReport) -> Self {
        match report {
            ErrorReport::TopicAlreadyExists { path } => Self::TopicAlreadyExists(path),
            ErrorReport::TopicNotFound { path } => Self::TopicNotFound(path),
            ErrorReport::InvalidPath { path, reason } => Self::InvalidPath { path, reason },
            ErrorReport::TypeMismatch {
                path,
                expected,
                actual,
            } => Self::TypeMismatch {
                path,
                expected,
                actual,
            },
            ErrorReport::InvalidValue { path, reason } => Self::InvalidValue { path, reason },
            ErrorReport::IncompatibleTopic { path, reason } => {
                Self::IncompatibleTopic { path, reason }
            }
            ErrorReport::InvalidFilter { filter, reason } => Self::InvalidFilter { filter, reason },
            ErrorReport::InvalidTopicView { view, reason } => Self::InvalidTopicView { view, reason },
            ErrorReport::SessionNotFound { session_id } => Self::SessionNotFound(session_id),
            ErrorReport::NoHandler { path } => {
                Self::RequestFailed(format!("no request handler registered for '{path}'"))
            }
            ErrorReport::RequestFailed { message } => Self::RequestFailed(message),
            ErrorReport::Rejected { message } => Self::Protocol(message),
        }
    }
}
