//! Unified error type for the engine
//!
//! Errors fall into a few buckets that callers branch on:
//! - fatal errors (missing connection, missing workflow, bad configuration)
//!   fail a job immediately without consuming retries
//! - `HistoryExpired` is a signal from the mail driver that the stored
//!   cursor is too old; the coordinator turns it into a baseline reset
//! - everything else is treated as transient and retried per job backoff

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application error type for jobs, stores and collaborators
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum FlowError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Ownership mismatch: {0}")]
    Ownership(String),

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("Invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("Unknown job kind: {0}")]
    UnknownJob(String),

    #[error("History cursor expired: {0}")]
    HistoryExpired(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{0}")]
    Other(String),
}

impl FlowError {
    /// Errors that retrying cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Config(_)
                | Self::ConnectionNotFound(_)
                | Self::WorkflowNotFound(_)
                | Self::ExecutionNotFound(_)
                | Self::Ownership(_)
                | Self::InvalidWorkflow(_)
                | Self::UnknownJob(_)
                | Self::InvalidInput(_)
        )
    }

    pub fn is_history_expired(&self) -> bool {
        matches!(self, Self::HistoryExpired(_))
    }
}

impl From<std::io::Error> for FlowError {
    fn from(err: std::io::Error) -> Self {
        FlowError::Io(err.to_string())
    }
}

impl From<toml::de::Error> for FlowError {
    fn from(err: toml::de::Error) -> Self {
        FlowError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Parse(err.to_string())
    }
}

impl From<rusqlite::Error> for FlowError {
    fn from(err: rusqlite::Error) -> Self {
        FlowError::Database(err.to_string())
    }
}

impl From<r2d2::Error> for FlowError {
    fn from(err: r2d2::Error) -> Self {
        FlowError::Database(err.to_string())
    }
}

impl From<reqwest::Error> for FlowError {
    fn from(err: reqwest::Error) -> Self {
        FlowError::Network(err.to_string())
    }
}

impl From<String> for FlowError {
    fn from(err: String) -> Self {
        FlowError::Other(err)
    }
}

impl From<&str> for FlowError {
    fn from(err: &str) -> Self {
        FlowError::Other(err.to_string())
    }
}

/// Result type alias using FlowError
pub type Result<T> = std::result::Result<T, FlowError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(FlowError::ConnectionNotFound("c1".into()).is_fatal());
        assert!(FlowError::UnknownJob("mystery".into()).is_fatal());
        assert!(!FlowError::RateLimited("slow down".into()).is_fatal());
        assert!(!FlowError::HistoryExpired("42".into()).is_fatal());
        assert!(FlowError::HistoryExpired("42".into()).is_history_expired());
    }

    #[test]
    fn test_serializes_as_tagged_message() {
        let json = serde_json::to_value(FlowError::Queue("full".into())).unwrap();
        assert_eq!(json["type"], "Queue");
        assert_eq!(json["message"], "full");
    }
}
