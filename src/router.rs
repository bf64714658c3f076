//! Dead-letter routing
//!
//! Records that leave the in-process retry loop unprocessed are republished
//! to either the retry topic or the dead-letter topic. Key and value bytes
//! are carried over untouched; provenance headers are appended after any
//! headers the producer already set.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::broker::{BrokerClient, ConsumerRecord, ProducerRecord, RecordMetadata};
use crate::classify::{Classification, ClassificationResult};
use crate::config::duration_ms;
use crate::error::{ProcessingError, RoutingError};

pub const HEADER_SOURCE_TOPIC: &str = "sourceTopic";
pub const HEADER_PARTITION: &str = "partition";
pub const HEADER_OFFSET: &str = "offset";
pub const HEADER_EXCEPTION_MESSAGE: &str = "exceptionMessage";
pub const HEADER_EXCEPTION_KIND: &str = "exceptionKind";

pub const RETRY_TOPIC_SUFFIX: &str = ".RETRY";
pub const DEAD_LETTER_TOPIC_SUFFIX: &str = ".DLT";

/// Topic names. Retry and dead-letter topics default to `<source>.RETRY`
/// and `<source>.DLT`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    pub source: String,
    pub retry: Option<String>,
    pub dead_letter: Option<String>,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            source: "library-events".to_string(),
            retry: None,
            dead_letter: None,
        }
    }
}

impl TopicsConfig {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            retry: None,
            dead_letter: None,
        }
    }

    pub fn retry_topic(&self) -> String {
        self.retry
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.source, RETRY_TOPIC_SUFFIX))
    }

    pub fn dead_letter_topic(&self) -> String {
        self.dead_letter
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.source, DEAD_LETTER_TOPIC_SUFFIX))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Bounded wait for a single publish
    #[serde(rename = "publish_timeout_ms", with = "duration_ms")]
    pub publish_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteTarget {
    RetryTopic,
    DeadLetterTopic,
}

impl RouteTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteTarget::RetryTopic => "retry",
            RouteTarget::DeadLetterTopic => "dead_letter",
        }
    }
}

/// Where a record ended up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub target: RouteTarget,
    pub metadata: RecordMetadata,
}

pub struct DeadLetterRouter<B> {
    broker: Arc<B>,
    retry_topic: String,
    dead_letter_topic: String,
    retry_enabled: bool,
    publish_timeout: Duration,
}

impl<B> std::fmt::Debug for DeadLetterRouter<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterRouter")
            .field("retry_topic", &self.retry_topic)
            .field("dead_letter_topic", &self.dead_letter_topic)
            .field("retry_enabled", &self.retry_enabled)
            .field("publish_timeout", &self.publish_timeout)
            .finish()
    }
}

impl<B> DeadLetterRouter<B>
where
    B: BrokerClient + 'static,
{
    /// `retry_enabled` reflects whether anything consumes the retry topic;
    /// when it is false every routed record goes to the dead-letter topic.
    pub fn new(broker: Arc<B>, topics: &TopicsConfig, retry_enabled: bool, config: &RouterConfig) -> Self {
        Self {
            broker,
            retry_topic: topics.retry_topic(),
            dead_letter_topic: topics.dead_letter_topic(),
            retry_enabled,
            publish_timeout: config.publish_timeout,
        }
    }

    pub fn retry_topic(&self) -> &str {
        &self.retry_topic
    }

    pub fn dead_letter_topic(&self) -> &str {
        &self.dead_letter_topic
    }

    /// Pick the destination for a record that is done with in-process retries
    pub fn decide(
        &self,
        record: &ConsumerRecord,
        classification: &ClassificationResult,
    ) -> Result<RouteTarget, RoutingError> {
        match classification.kind {
            Classification::Ignorable => Err(RoutingError::NotRoutable),
            Classification::NonRetryable => Ok(RouteTarget::DeadLetterTopic),
            Classification::Retryable => {
                // provenance headers may come from outside producers
                if record.topic == self.retry_topic || !self.retry_enabled {
                    Ok(RouteTarget::DeadLetterTopic)
                } else {
                    Ok(RouteTarget::RetryTopic)
                }
            }
        }
    }

    fn topic_for(&self, target: RouteTarget) -> &str {
        match target {
            RouteTarget::RetryTopic => &self.retry_topic,
            RouteTarget::DeadLetterTopic => &self.dead_letter_topic,
        }
    }

    /// Copy of `record` addressed to `topic` with provenance headers appended
    pub fn enrich(record: &ConsumerRecord, topic: &str, error: &ProcessingError) -> ProducerRecord {
        let mut headers = record.headers.clone();
        headers.append(HEADER_SOURCE_TOPIC, record.topic.clone());
        headers.append(HEADER_PARTITION, record.partition.to_string());
        headers.append(HEADER_OFFSET, record.offset.to_string());
        headers.append(HEADER_EXCEPTION_MESSAGE, error.message());
        headers.append(HEADER_EXCEPTION_KIND, error.cause().as_str());

        ProducerRecord::new(topic, record.key.clone(), record.value.clone())
            .with_partition(record.partition)
            .with_headers(headers)
    }

    pub async fn route(
        &self,
        record: &ConsumerRecord,
        classification: &ClassificationResult,
        error: &ProcessingError,
    ) -> Result<Routed, RoutingError> {
        let target = self.decide(record, classification)?;
        let topic = self.topic_for(target).to_string();
        let outgoing = Self::enrich(record, &topic, error);

        debug!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            destination = %topic,
            "Routing failed record"
        );

        let published = tokio::time::timeout(self.publish_timeout, self.broker.publish(outgoing)).await;

        match published {
            Ok(Ok(metadata)) => {
                info!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    destination = %metadata.topic,
                    destination_offset = metadata.offset,
                    target = target.as_str(),
                    "Record routed"
                );
                Ok(Routed { target, metadata })
            }
            Ok(Err(e)) => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    destination = %topic,
                    error = %e,
                    "Failed to publish record to failure topic"
                );
                Err(RoutingError::PublishFailed {
                    topic,
                    message: e.to_string(),
                })
            }
            Err(_) => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    destination = %topic,
                    timeout_ms = self.publish_timeout.as_millis() as u64,
                    "Publish to failure topic timed out"
                );
                Err(RoutingError::PublishTimeout {
                    topic,
                    timeout: self.publish_timeout,
                })
            }
        }
    }
}
