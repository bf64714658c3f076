// tests/common/mod.rs
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use library_events_consumer::{ConsumerRecord, PipelineConfig, ProcessingError, RecordProcessor};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("library_events_consumer=debug".parse().unwrap())
                    .add_directive("integration_tests=debug".parse().unwrap()),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .try_init()
            .ok();
    });
}

pub const FAST_CONFIG: &str = r#"
[consumer]
concurrency = 1
poll_interval_ms = 10
processing_timeout_ms = 1000

[consumer.backoff]
kind = "fixed"
delay_ms = 10
max_attempts = 2

[retry_consumer]
enabled = ${LEC_IT_RETRY_ENABLED:false}
poll_interval_ms = 10

[retry_consumer.backoff]
kind = "fixed"
delay_ms = 10
max_attempts = 2

[router]
publish_timeout_ms = 200

[scheduler]
period_ms = 100
"#;

#[allow(dead_code)]
pub fn create_test_config() -> PipelineConfig {
    PipelineConfig::from_toml_str(FAST_CONFIG).expect("valid test config")
}

/// Wraps a processor and counts calls
pub struct CountingProcessor<P> {
    inner: P,
    calls: Arc<AtomicUsize>,
}

#[allow(dead_code)]
impl<P> CountingProcessor<P> {
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: RecordProcessor> RecordProcessor for CountingProcessor<P> {
    async fn process(&self, record: &ConsumerRecord) -> Result<(), ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.process(record).await
    }
}

#[allow(dead_code)]
pub async fn wait_until<F, Fut>(mut check: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while !check().await {
        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}
