//! Assembly of the full failure pipeline from a [`PipelineConfig`]

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::broker::BrokerClient;
use crate::classify::ErrorClassifier;
use crate::config::PipelineConfig;
use crate::consumer::{Consumer, RecordProcessor};
use crate::error::{ProcessorError, Result};
use crate::monitoring::ProcessingEvent;
use crate::router::DeadLetterRouter;
use crate::scheduler::ReconciliationScheduler;
use crate::store::FailureStore;

/// Primary consumer, retry-topic consumer and reconciliation scheduler
/// sharing one processor, broker, failure store and router
pub struct Pipeline<P, B, S> {
    primary: Consumer<P, B, S>,
    retry: Consumer<P, B, S>,
    scheduler: ReconciliationScheduler<P, S>,
    router: Arc<DeadLetterRouter<B>>,
}

impl<P, B, S> Pipeline<P, B, S>
where
    P: RecordProcessor + 'static,
    B: BrokerClient + 'static,
    S: FailureStore + 'static,
{
    /// Returns the pipeline and, when monitoring is enabled, the single
    /// channel every component reports into
    pub fn new(
        config: &PipelineConfig,
        processor: Arc<P>,
        broker: Arc<B>,
        store: Arc<S>,
    ) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        let classifier = Arc::new(ErrorClassifier::from_config(&config.classifier));
        let router = Arc::new(DeadLetterRouter::new(
            broker.clone(),
            &config.topics,
            config.retry_consumer.enabled,
            &config.router,
        ));

        let (primary, _) = Consumer::new(
            config.primary_consumer(),
            processor.clone(),
            broker.clone(),
            store.clone(),
            router.clone(),
            classifier.clone(),
        );
        let (retry, _) = Consumer::new(
            config.retry_topic_consumer(),
            processor.clone(),
            broker,
            store.clone(),
            router.clone(),
            classifier,
        );
        let scheduler = ReconciliationScheduler::new(processor, store, config.scheduler.clone());

        if !config.monitoring.enabled {
            return (
                Self {
                    primary,
                    retry,
                    scheduler,
                    router,
                },
                None,
            );
        }

        let (tx, rx) = mpsc::channel(config.monitoring.channel_size);
        let pipeline = Self {
            primary: primary.with_monitoring(tx.clone()),
            retry: retry.with_monitoring(tx.clone()),
            scheduler: scheduler.with_monitoring(tx),
            router,
        };
        (pipeline, Some(rx))
    }

    pub fn primary(&self) -> &Consumer<P, B, S> {
        &self.primary
    }

    pub fn retry_consumer(&self) -> &Consumer<P, B, S> {
        &self.retry
    }

    pub fn scheduler(&self) -> &ReconciliationScheduler<P, S> {
        &self.scheduler
    }

    pub fn router(&self) -> &DeadLetterRouter<B> {
        &self.router
    }

    /// Run every component until shutdown. A consumer error stops the others.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(
            retry_topic = %self.router.retry_topic(),
            dead_letter_topic = %self.router.dead_letter_topic(),
            "Starting failure pipeline"
        );

        let scheduler = async {
            self.scheduler.run(shutdown.clone()).await;
            Ok::<(), ProcessorError>(())
        };

        tokio::try_join!(
            self.primary.run(shutdown.clone()),
            self.retry.run(shutdown.clone()),
            scheduler,
        )?;

        info!("Failure pipeline stopped");
        Ok(())
    }
}
