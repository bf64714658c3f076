use std::sync::{Arc, Once};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use crate::broker::InMemoryBroker;
use crate::classify::ErrorClassifier;
use crate::config::PipelineConfig;
use crate::consumer::{Consumer, ConsumerConfig};
use crate::monitoring::ProcessingEvent;
use crate::router::DeadLetterRouter;
use crate::test::mocks::{MockBroker, MockFailureStore, MockRecordProcessor};
use crate::test::TestUtils;

pub type TestConsumer = Consumer<MockRecordProcessor, MockBroker, MockFailureStore>;

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("library_events_consumer=debug".parse().unwrap())
                    .add_directive("test=debug".parse().unwrap()),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .ok();
    });
}

/// Shared doubles for one test
pub struct TestContext {
    pub config: PipelineConfig,
    pub broker: Arc<MockBroker>,
    pub store: Arc<MockFailureStore>,
    pub processor: Arc<MockRecordProcessor>,
    pub shutdown_tx: watch::Sender<bool>,
    pub shutdown_rx: watch::Receiver<bool>,
}

impl TestContext {
    pub fn new(max_attempts: u32, retry_enabled: bool) -> Self {
        init_logging();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config: TestUtils::fast_config(max_attempts, retry_enabled),
            broker: Arc::new(MockBroker::new(InMemoryBroker::new())),
            store: Arc::new(MockFailureStore::new()),
            processor: Arc::new(MockRecordProcessor::new()),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn router(&self) -> Arc<DeadLetterRouter<MockBroker>> {
        Arc::new(DeadLetterRouter::new(
            self.broker.clone(),
            &self.config.topics,
            self.config.retry_consumer.enabled,
            &self.config.router,
        ))
    }

    fn build(&self, config: ConsumerConfig) -> (TestConsumer, Option<mpsc::Receiver<ProcessingEvent>>) {
        Consumer::new(
            config,
            self.processor.clone(),
            self.broker.clone(),
            self.store.clone(),
            self.router(),
            Arc::new(ErrorClassifier::from_config(&self.config.classifier)),
        )
    }

    pub fn primary(&self) -> TestConsumer {
        self.build(self.config.primary_consumer()).0
    }

    pub fn retry_consumer(&self) -> TestConsumer {
        self.build(self.config.retry_topic_consumer()).0
    }

    /// Primary consumer with its own monitoring channel
    pub fn monitored_primary(&self) -> (TestConsumer, mpsc::Receiver<ProcessingEvent>) {
        let mut config = self.config.primary_consumer();
        config.monitoring.enabled = true;
        let (consumer, rx) = self.build(config);
        let rx = rx.expect("monitoring enabled");
        (consumer, rx)
    }

    pub async fn seed_source(&self, payloads: Vec<Bytes>) -> anyhow::Result<()> {
        TestUtils::seed_topic(self.broker.as_ref(), &self.config.topics.source, payloads).await?;
        Ok(())
    }

    pub fn source_topic(&self) -> String {
        self.config.topics.source.clone()
    }

    pub fn retry_topic(&self) -> String {
        self.config.topics.retry_topic()
    }

    pub fn dead_letter_topic(&self) -> String {
        self.config.topics.dead_letter_topic()
    }

    pub async fn committed(&self, group_id: &str, topic: &str) -> Option<i64> {
        use crate::broker::BrokerClient;
        self.broker
            .committed(group_id, topic, 0)
            .await
            .unwrap_or_default()
    }
}

#[allow(dead_code)]
pub async fn verify_processing_complete(
    processor: &MockRecordProcessor,
    expected_calls: usize,
    timeout: Duration,
) -> anyhow::Result<()> {
    let start = std::time::Instant::now();
    while processor.get_process_count() < expected_calls {
        if start.elapsed() > timeout {
            anyhow::bail!(
                "Timeout waiting for {} process calls, got {}",
                expected_calls,
                processor.get_process_count()
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
