//! Message transport contract
//!
//! The consumer only needs partition discovery, offset-addressed fetches,
//! per-group committed offsets and a publish call. Anything that speaks those
//! five operations can back the pipeline; [`InMemoryBroker`] is the bundled
//! implementation used by tests and local runs.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod memory;

pub use memory::InMemoryBroker;

/// Error type for broker operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Unknown topic: {0}")]
    UnknownTopic(String),

    #[error("Unknown partition {partition} for topic {topic}")]
    UnknownPartition { topic: String, partition: i32 },

    #[error("Broker request timed out: {0}")]
    Timeout(String),

    #[error("Broker unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}

/// Ordered, multi-valued record headers. Appending never replaces an
/// existing entry with the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, Bytes)>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, key: impl Into<String>, value: impl Into<Bytes>) {
        self.0.push((key.into(), value.into()));
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.append(key, value);
        self
    }

    /// Most recently appended value for `key`
    pub fn last(&self, key: &str) -> Option<&Bytes> {
        self.0.iter().rev().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn last_str(&self, key: &str) -> Option<&str> {
        self.last(key).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a Bytes> + 'a {
        self.0.iter().filter(move |(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.iter().any(|(k, _)| k == key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A record as delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
}

impl ConsumerRecord {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        key: Option<Bytes>,
        value: impl Into<Bytes>,
    ) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            key,
            value: value.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// A record to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Explicit partition; the broker picks one when `None`
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub headers: Headers,
}

impl ProducerRecord {
    pub fn new(topic: impl Into<String>, key: Option<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key,
            value: value.into(),
            headers: Headers::new(),
        }
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }
}

/// Where a published record landed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn partitions(&self, topic: &str) -> Result<Vec<i32>, BrokerError>;

    /// Up to `max_records` records of one partition starting at `offset`
    async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        max_records: usize,
    ) -> Result<Vec<ConsumerRecord>, BrokerError>;

    /// Next offset to read for the group, if it has committed one
    async fn committed(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
    ) -> Result<Option<i64>, BrokerError>;

    async fn commit(
        &self,
        group_id: &str,
        topic: &str,
        partition: i32,
        next_offset: i64,
    ) -> Result<(), BrokerError>;

    async fn publish(&self, record: ProducerRecord) -> Result<RecordMetadata, BrokerError>;
}
