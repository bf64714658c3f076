//! Test utilities and mock implementations for exercising the failure pipeline


use std::time::Duration;

use bytes::Bytes;

use crate::broker::{BrokerClient, BrokerError, ConsumerRecord, ProducerRecord, RecordMetadata};
use crate::config::PipelineConfig;
use crate::library::LibraryEventType;
use crate::retry::BackoffPolicy;

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    /// JSON payload for a library event in the wire shape
    pub fn library_event_json(id: Option<i64>, event_type: LibraryEventType) -> Bytes {
        let id = id.map(|id| id.to_string()).unwrap_or_else(|| "null".to_string());
        let event_type = match event_type {
            LibraryEventType::New => "NEW",
            LibraryEventType::Update => "UPDATE",
        };
        Bytes::from(format!(
            r#"{{"libraryEventId":{},"libraryEventType":"{}","book":{{"bookId":456,"bookName":"Kafka Using Spring Boot","bookAuthor":"Dilip"}}}}"#,
            id, event_type
        ))
    }

    pub fn create_test_record(topic: &str, partition: i32, offset: i64, data: &[u8]) -> ConsumerRecord {
        ConsumerRecord::new(topic, partition, offset, None, Bytes::copy_from_slice(data))
    }

    /// Publish `payloads` to partition 0 of `topic`, in order
    pub async fn seed_topic<B: BrokerClient>(
        broker: &B,
        topic: &str,
        payloads: Vec<Bytes>,
    ) -> Result<Vec<RecordMetadata>, BrokerError> {
        let mut published = Vec::with_capacity(payloads.len());
        for payload in payloads {
            let record = ProducerRecord::new(topic, None, payload).with_partition(0);
            published.push(broker.publish(record).await?);
        }
        Ok(published)
    }

    /// Pipeline configuration with short delays and timeouts
    pub fn fast_config(max_attempts: u32, retry_enabled: bool) -> PipelineConfig {
        let mut config = PipelineConfig::default();
        let backoff = BackoffPolicy::Fixed {
            delay_ms: 10,
            max_attempts,
        };

        config.consumer.concurrency = 1;
        config.consumer.poll_interval = Duration::from_millis(10);
        config.consumer.processing_timeout = Duration::from_secs(1);
        config.consumer.backoff = backoff.clone();

        config.retry_consumer.enabled = retry_enabled;
        config.retry_consumer.concurrency = 1;
        config.retry_consumer.poll_interval = Duration::from_millis(10);
        config.retry_consumer.processing_timeout = Duration::from_secs(1);
        config.retry_consumer.backoff = backoff;

        config.router.publish_timeout = Duration::from_millis(200);
        config.scheduler.period = Duration::from_millis(100);
        config
    }
}

/// Assertion helpers for tests
#[cfg(test)]
pub mod assertions {
    use super::*;

    pub async fn assert_processed_records(
        processor: &mocks::MockRecordProcessor,
        expected_count: usize,
    ) -> anyhow::Result<()> {
        let records = processor.get_processed_records().await;
        assert_eq!(records.len(), expected_count);
        Ok(())
    }

    pub async fn wait_for_condition<F>(mut check: F, timeout: Duration) -> anyhow::Result<()>
    where
        F: FnMut() -> bool,
    {
        let start = std::time::Instant::now();
        while !check() {
            if start.elapsed() > timeout {
                anyhow::bail!("Condition not met within timeout");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::LibraryEvent;

    #[test]
    fn test_library_event_json() {
        let payload = TestUtils::library_event_json(Some(999), LibraryEventType::Update);
        let event: LibraryEvent = serde_json::from_slice(&payload).unwrap();
        assert_eq!(event.library_event_id, Some(999));
        assert_eq!(event.library_event_type, LibraryEventType::Update);

        let payload = TestUtils::library_event_json(None, LibraryEventType::New);
        let event: LibraryEvent = serde_json::from_slice(&payload).unwrap();
        assert_eq!(event.library_event_id, None);
    }

    #[tokio::test]
    async fn test_seed_topic() -> anyhow::Result<()> {
        let broker = crate::broker::InMemoryBroker::new();
        let published = TestUtils::seed_topic(
            &broker,
            "library-events",
            vec![Bytes::from("a"), Bytes::from("b")],
        )
        .await?;

        assert_eq!(published.len(), 2);
        assert_eq!(published[1].offset, 1);
        assert_eq!(broker.topic_len("library-events"), 2);
        Ok(())
    }

    #[test]
    fn test_fast_config_is_valid() {
        let config = TestUtils::fast_config(2, true);
        config.validate().unwrap();
        assert_eq!(config.consumer.backoff.max_attempts(), 2);
        assert!(config.retry_consumer.enabled);
    }
}
