//! Failure store implementations
//!
//! The store is the only shared mutable state of the pipeline. Consumers
//! insert rows; after that only the reconciliation scheduler touches a row,
//! and every status change goes through the compare-and-set
//! [`FailureStore::transition`].

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::ConsumerRecord;
use crate::error::StoreError;

#[cfg(feature = "dynamodb-store")]
pub mod dynamodb;
pub mod memory;

/// Lifecycle of a failure record. `Dead` and `Skipped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureStatus {
    Retry,
    Dead,
    Skipped,
}

impl FailureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStatus::Retry => "RETRY",
            FailureStatus::Dead => "DEAD",
            FailureStatus::Skipped => "SKIPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, FailureStatus::Retry)
    }

    pub fn can_transition_to(&self, next: FailureStatus) -> bool {
        matches!(
            (self, next),
            (FailureStatus::Retry, FailureStatus::Skipped) | (FailureStatus::Retry, FailureStatus::Dead)
        )
    }
}

impl fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RETRY" => Ok(FailureStatus::Retry),
            "DEAD" => Ok(FailureStatus::Dead),
            "SKIPPED" => Ok(FailureStatus::Skipped),
            other => Err(StoreError::InvalidData(format!("unknown status {}", other))),
        }
    }
}

/// One row per record that left the in-process retry loop unprocessed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub id: Uuid,
    pub source_topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub partition: i32,
    pub offset: i64,
    pub last_error_message: String,
    pub status: FailureStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FailureRecord {
    /// Rebuild the delivery this row was captured from. Headers are not kept.
    pub fn to_consumer_record(&self) -> ConsumerRecord {
        ConsumerRecord::new(
            self.source_topic.clone(),
            self.partition,
            self.offset,
            self.key.clone(),
            self.payload.clone(),
        )
    }
}

/// Insert payload; the store assigns id and timestamps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFailureRecord {
    pub source_topic: String,
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub partition: i32,
    pub offset: i64,
    pub error_message: String,
    pub status: FailureStatus,
}

impl NewFailureRecord {
    pub fn from_consumer_record(
        record: &ConsumerRecord,
        error_message: impl Into<String>,
        status: FailureStatus,
    ) -> Self {
        Self {
            source_topic: record.topic.clone(),
            key: record.key.clone(),
            payload: record.value.clone(),
            partition: record.partition,
            offset: record.offset,
            error_message: error_message.into(),
            status,
        }
    }

    pub(crate) fn into_record(self, id: Uuid, now: DateTime<Utc>) -> FailureRecord {
        FailureRecord {
            id,
            source_topic: self.source_topic,
            key: self.key,
            payload: self.payload,
            partition: self.partition,
            offset: self.offset,
            last_error_message: self.error_message,
            status: self.status,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Trait for failure storage implementations
#[async_trait]
pub trait FailureStore: Send + Sync {
    async fn insert(&self, record: NewFailureRecord) -> Result<FailureRecord, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<FailureRecord>, StoreError>;

    /// Rows in a given status, oldest first
    async fn find_by_status(&self, status: FailureStatus) -> Result<Vec<FailureRecord>, StoreError>;

    /// Atomically move a row from `from` to `to`. Returns `Ok(false)` when the
    /// row is missing or no longer in `from`.
    async fn transition(
        &self,
        id: Uuid,
        from: FailureStatus,
        to: FailureStatus,
    ) -> Result<bool, StoreError>;

    async fn update_error_message(&self, id: Uuid, message: &str) -> Result<(), StoreError>;
}

// Re-export implementations
#[cfg(feature = "dynamodb-store")]
pub use dynamodb::DynamoDbFailureStore;
pub use memory::InMemoryFailureStore;
