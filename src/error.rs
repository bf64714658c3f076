//! Error types for the consumer pipeline

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use uuid::Uuid;

use crate::broker::BrokerError;
use crate::store::FailureStatus;

/// Main error type for consumer and pipeline operations
#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("Failed to list partitions for topic {topic}: {message}")]
    PartitionDiscovery { topic: String, message: String },

    #[error("Failed to fetch records: {0}")]
    FetchFailed(String),

    #[error("Failed to commit offset: {0}")]
    CommitFailed(String),

    #[error("Record processing attempt timed out after {0:?}")]
    ProcessingTimeout(Duration),

    #[error("Broker error: {0}")]
    BrokerError(String),

    #[error("Failure store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Shutdown requested")]
    Shutdown,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<BrokerError> for ProcessorError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::UnknownTopic(topic) => ProcessorError::PartitionDiscovery {
                message: format!("unknown topic {}", topic),
                topic,
            },
            BrokerError::UnknownPartition { topic, partition } => {
                ProcessorError::FetchFailed(format!("unknown partition {}/{}", topic, partition))
            }
            BrokerError::Timeout(msg) => ProcessorError::BrokerError(format!("Timeout: {}", msg)),
            BrokerError::Unavailable(msg) => {
                ProcessorError::BrokerError(format!("Broker unavailable: {}", msg))
            }
            BrokerError::Other(msg) => ProcessorError::BrokerError(msg),
        }
    }
}

impl From<JoinError> for ProcessorError {
    fn from(err: JoinError) -> Self {
        ProcessorError::Other(err.into())
    }
}

/// Result type for consumer operations
pub type Result<T> = std::result::Result<T, ProcessorError>;

/// Cause category reported by the business handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cause {
    /// Transient dependency or environment failure
    Recoverable,
    /// Malformed or semantically invalid payload
    Validation,
    /// Anything the handler could not place
    Unclassified,
}

impl Cause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cause::Recoverable => "recoverable",
            Cause::Validation => "validation",
            Cause::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for Cause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure returned by a [`RecordProcessor`](crate::RecordProcessor)
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Recoverable failure: {0}")]
    Recoverable(#[source] anyhow::Error),

    #[error("Validation failure: {0}")]
    Validation(#[source] anyhow::Error),

    #[error("Unclassified failure: {0}")]
    Unclassified(#[source] anyhow::Error),
}

impl ProcessingError {
    pub fn recoverable(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Recoverable(err.into())
    }

    pub fn validation(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Validation(err.into())
    }

    pub fn unclassified(err: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Unclassified(err.into())
    }

    pub fn cause(&self) -> Cause {
        match self {
            ProcessingError::Recoverable(_) => Cause::Recoverable,
            ProcessingError::Validation(_) => Cause::Validation,
            ProcessingError::Unclassified(_) => Cause::Unclassified,
        }
    }

    /// Underlying message including its context chain, without the category prefix
    pub fn message(&self) -> String {
        match self {
            ProcessingError::Recoverable(e)
            | ProcessingError::Validation(e)
            | ProcessingError::Unclassified(e) => format!("{:#}", e),
        }
    }
}

/// Publish to the retry or dead-letter topic failed; there is no further fallback
#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Publish to {topic} timed out after {timeout:?}")]
    PublishTimeout { topic: String, timeout: Duration },

    #[error("Publish to {topic} failed: {message}")]
    PublishFailed { topic: String, message: String },

    #[error("Ignorable failures are never routed")]
    NotRoutable,
}

/// Error type for failure store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Failed to insert failure record: {0}")]
    InsertFailed(String),

    #[error("Failed to query failure records: {0}")]
    QueryFailed(String),

    #[error("Failed to update failure record {id}: {message}")]
    UpdateFailed { id: Uuid, message: String },

    #[error("Invalid status transition {from} -> {to}")]
    InvalidTransition {
        from: FailureStatus,
        to: FailureStatus,
    },

    #[error("Invalid failure record data: {0}")]
    InvalidData(String),
}
