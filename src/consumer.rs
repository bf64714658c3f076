//! Partition-lane consumer with bounded retry and dead-letter hand-off
//!
//! This module drives the per-record failure protocol:
//!
//! - Static partition assignment onto a fixed worker pool
//! - In-process retries with backoff, suspending only the owning lane
//! - Dead-letter routing and failure persistence on give-up
//! - Offset commits once a record is settled
//!
//! The same [`Consumer`] type serves both the primary topic and the retry
//! topic; they differ only in configuration.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::broker::{BrokerClient, BrokerError, ConsumerRecord};
use crate::classify::{Classification, ClassificationResult, ErrorClassifier};
use crate::config::duration_ms;
use crate::error::{ProcessingError, ProcessorError, Result};
use crate::monitoring::{LaneEventType, MonitoringConfig, ProcessingEvent};
use crate::retry::{shutdown_requested, Backoff, BackoffPolicy, RetryHandle, RetryOutcome};
use crate::router::DeadLetterRouter;
use crate::store::{FailureStatus, FailureStore, NewFailureRecord};

/// Business processing contract
///
/// Implementations must tolerate being invoked more than once for the same
/// logical record: deliveries are at-least-once, and the reconciliation
/// scheduler may replay a record concurrently with live traffic.
///
/// # Examples
///
/// ```rust
/// use library_events_consumer::{ConsumerRecord, ProcessingError, RecordProcessor};
///
/// struct Echo;
///
/// #[async_trait::async_trait]
/// impl RecordProcessor for Echo {
///     async fn process(&self, record: &ConsumerRecord) -> Result<(), ProcessingError> {
///         std::str::from_utf8(&record.value)
///             .map(|_| ())
///             .map_err(ProcessingError::validation)
///     }
/// }
/// ```
#[async_trait]
pub trait RecordProcessor: Send + Sync {
    async fn process(&self, record: &ConsumerRecord) -> std::result::Result<(), ProcessingError>;
}

#[async_trait]
impl<T: RecordProcessor + ?Sized> RecordProcessor for Arc<T> {
    async fn process(&self, record: &ConsumerRecord) -> std::result::Result<(), ProcessingError> {
        (**self).process(record).await
    }
}

/// Configuration for one consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Topic to consume
    pub topic: String,
    /// Consumer group whose committed offsets this consumer owns
    pub group_id: String,
    /// A disabled consumer returns from `run` immediately
    pub enabled: bool,
    /// Number of workers; partition `p` is owned by worker `p % concurrency`
    pub concurrency: usize,
    /// Maximum records per fetch
    pub batch_size: usize,
    /// Idle wait between polls that returned nothing
    #[serde(rename = "poll_interval_ms", with = "duration_ms")]
    pub poll_interval: Duration,
    /// Upper bound on a single `process` call; exceeding it is a recoverable failure
    #[serde(rename = "processing_timeout_ms", with = "duration_ms")]
    pub processing_timeout: Duration,
    /// In-process retry budget and delays
    pub backoff: BackoffPolicy,
    #[serde(skip)]
    pub monitoring: MonitoringConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            topic: "library-events".to_string(),
            group_id: "library-events-listener-group".to_string(),
            enabled: true,
            concurrency: 3,
            batch_size: 100,
            poll_interval: Duration::from_millis(100),
            processing_timeout: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

/// What the lane does after a record has been handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Commit past the record
    Advance,
    /// Neither routed nor persisted; leave the committed offset in place
    Hold,
}

/// Result of one fetch-and-handle pass over a partition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollResult {
    pub fetched: usize,
    pub advanced: usize,
    pub held: bool,
}

/// Internal context holding consumer state and dependencies
pub struct ProcessingContext<P, B, S> {
    processor: Arc<P>,
    broker: Arc<B>,
    store: Arc<S>,
    router: Arc<DeadLetterRouter<B>>,
    classifier: Arc<ErrorClassifier>,
    backoff: Arc<dyn Backoff>,
    config: ConsumerConfig,
    monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl<P, B, S> Clone for ProcessingContext<P, B, S> {
    fn clone(&self) -> Self {
        Self {
            processor: self.processor.clone(),
            broker: self.broker.clone(),
            store: self.store.clone(),
            router: self.router.clone(),
            classifier: self.classifier.clone(),
            backoff: self.backoff.clone(),
            config: self.config.clone(),
            monitoring_tx: self.monitoring_tx.clone(),
        }
    }
}

impl<P, B, S> ProcessingContext<P, B, S> {
    /// Sends a monitoring event if monitoring is enabled
    async fn send_monitoring_event(&self, event: ProcessingEvent) {
        if let Some(tx) = &self.monitoring_tx {
            if let Err(e) = tx.send(event).await {
                warn!(error = %e, "Failed to send monitoring event");
            } else {
                trace!("Sent monitoring event successfully");
            }
        }
    }
}

/// Consumer for one topic
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use library_events_consumer::{
///     Consumer, ConsumerConfig, DeadLetterRouter, ErrorClassifier, InMemoryBroker,
///     InMemoryFailureStore, LibraryEventsService, RouterConfig, TopicsConfig,
/// };
///
/// async fn run_consumer() -> Result<(), library_events_consumer::ProcessorError> {
///     let broker = Arc::new(InMemoryBroker::new());
///     let store = Arc::new(InMemoryFailureStore::new());
///     let router = Arc::new(DeadLetterRouter::new(
///         broker.clone(),
///         &TopicsConfig::default(),
///         false,
///         &RouterConfig::default(),
///     ));
///     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
///
///     let (consumer, _monitoring_rx) = Consumer::new(
///         ConsumerConfig::default(),
///         Arc::new(LibraryEventsService::in_memory()),
///         broker,
///         store,
///         router,
///         Arc::new(ErrorClassifier::new()),
///     );
///
///     consumer.run(shutdown_rx).await
/// }
/// ```
pub struct Consumer<P, B, S> {
    context: ProcessingContext<P, B, S>,
}

impl<P, B, S> Consumer<P, B, S>
where
    P: RecordProcessor + 'static,
    B: BrokerClient + 'static,
    S: FailureStore + 'static,
{
    /// Creates a new consumer
    ///
    /// Returns the consumer and, when `config.monitoring.enabled`, the
    /// receiving end of its monitoring channel.
    pub fn new(
        config: ConsumerConfig,
        processor: Arc<P>,
        broker: Arc<B>,
        store: Arc<S>,
        router: Arc<DeadLetterRouter<B>>,
        classifier: Arc<ErrorClassifier>,
    ) -> (Self, Option<mpsc::Receiver<ProcessingEvent>>) {
        let (monitoring_tx, monitoring_rx) = if config.monitoring.enabled {
            let (tx, rx) = mpsc::channel(config.monitoring.channel_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let context = ProcessingContext {
            processor,
            broker,
            store,
            router,
            classifier,
            backoff: config.backoff.build(),
            config,
            monitoring_tx,
        };

        (Self { context }, monitoring_rx)
    }

    /// Send monitoring events to an existing channel instead of a private one
    pub fn with_monitoring(mut self, tx: mpsc::Sender<ProcessingEvent>) -> Self {
        self.context.monitoring_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.context.config
    }

    /// Consume until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let ctx = &self.context;
        if !ctx.config.enabled {
            info!(topic = %ctx.config.topic, "Consumer disabled");
            return Ok(());
        }

        info!(
            topic = %ctx.config.topic,
            group_id = %ctx.config.group_id,
            "Starting consumer"
        );

        let partitions = match Self::discover_partitions(ctx, &mut shutdown).await {
            Ok(partitions) => partitions,
            Err(ProcessorError::Shutdown) => return Ok(()),
            Err(e) => return Err(e),
        };

        let workers = ctx.config.concurrency.max(1);
        let mut assignment = Self::assign(&partitions, workers);
        let mut handles = Vec::new();
        for worker in 0..workers {
            let assigned = assignment.remove(&worker).unwrap_or_default();
            debug!(
                topic = %ctx.config.topic,
                worker,
                partitions = ?assigned,
                "Starting worker"
            );
            let ctx = ctx.clone();
            let shutdown_rx = shutdown.clone();
            handles.push(tokio::spawn(async move {
                Self::run_worker(&ctx, worker, workers, assigned, shutdown_rx).await
            }));
        }

        for handle in handles {
            handle.await??;
        }

        info!(topic = %ctx.config.topic, "Consumer shutdown complete");
        Ok(())
    }

    /// Partition `p` goes to worker `p % concurrency`; workers without a
    /// partition have no entry
    fn assign(partitions: &[i32], concurrency: usize) -> BTreeMap<usize, Vec<i32>> {
        let workers = concurrency.max(1);
        let mut assignment: BTreeMap<usize, Vec<i32>> = BTreeMap::new();
        for &partition in partitions {
            let worker = partition.rem_euclid(workers as i32) as usize;
            assignment.entry(worker).or_default().push(partition);
        }
        assignment
    }

    /// Wait for the topic to exist; the retry topic only appears on first use.
    /// Broker errors are retried until shutdown.
    async fn discover_partitions(
        ctx: &ProcessingContext<P, B, S>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Vec<i32>> {
        loop {
            match ctx.broker.partitions(&ctx.config.topic).await {
                Ok(partitions) => {
                    info!(
                        topic = %ctx.config.topic,
                        count = partitions.len(),
                        "Discovered partitions"
                    );
                    return Ok(partitions);
                }
                Err(BrokerError::UnknownTopic(_)) => {
                    trace!(topic = %ctx.config.topic, "Topic not found yet, waiting");
                }
                Err(e) => {
                    warn!(topic = %ctx.config.topic, error = %e, "Failed to list partitions, retrying");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(ctx.config.poll_interval) => {}
                _ = shutdown_requested(shutdown) => return Err(ProcessorError::Shutdown),
            }
        }
    }

    /// Partitions of the topic owned by `worker`, when the listing succeeds
    async fn owned_partitions(
        ctx: &ProcessingContext<P, B, S>,
        worker: usize,
        workers: usize,
    ) -> Option<Vec<i32>> {
        match ctx.broker.partitions(&ctx.config.topic).await {
            Ok(partitions) => Some(
                partitions
                    .into_iter()
                    .filter(|p| p.rem_euclid(workers as i32) as usize == worker)
                    .collect(),
            ),
            Err(e) => {
                trace!(topic = %ctx.config.topic, worker, error = %e, "Partition refresh failed");
                None
            }
        }
    }

    async fn announce(ctx: &ProcessingContext<P, B, S>, partitions: &[i32]) {
        for &partition in partitions {
            ctx.send_monitoring_event(ProcessingEvent::lane_event(
                &ctx.config.topic,
                partition,
                LaneEventType::Started,
                None,
            ))
            .await;
        }
    }

    async fn run_worker(
        ctx: &ProcessingContext<P, B, S>,
        worker: usize,
        workers: usize,
        mut partitions: Vec<i32>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        Self::announce(ctx, &partitions).await;

        loop {
            if *shutdown.borrow() {
                break;
            }

            // topics may gain partitions while running
            if let Some(current) = Self::owned_partitions(ctx, worker, workers).await {
                let added: Vec<i32> = current
                    .iter()
                    .copied()
                    .filter(|p| !partitions.contains(p))
                    .collect();
                if !added.is_empty() {
                    info!(topic = %ctx.config.topic, worker, partitions = ?added, "Picked up new partitions");
                    Self::announce(ctx, &added).await;
                    partitions.extend(added);
                    partitions.sort_unstable();
                }
            }

            let mut idle = true;
            for &partition in &partitions {
                match Self::poll_partition(ctx, partition, &mut shutdown).await {
                    Ok(result) => {
                        if result.fetched > 0 && !result.held {
                            idle = false;
                        }
                    }
                    Err(ProcessorError::Shutdown) => {
                        ctx.send_monitoring_event(ProcessingEvent::lane_event(
                            &ctx.config.topic,
                            partition,
                            LaneEventType::Interrupted,
                            Some("shutdown".to_string()),
                        ))
                        .await;
                        return Ok(());
                    }
                    Err(e) => {
                        warn!(
                            topic = %ctx.config.topic,
                            partition,
                            error = %e,
                            "Partition poll failed"
                        );
                        ctx.send_monitoring_event(ProcessingEvent::lane_event(
                            &ctx.config.topic,
                            partition,
                            LaneEventType::Error,
                            Some(e.to_string()),
                        ))
                        .await;
                    }
                }
            }

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(ctx.config.poll_interval) => {}
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        }

        debug!(topic = %ctx.config.topic, partitions = ?partitions, "Worker stopped");
        Ok(())
    }

    /// Run one fetch-and-handle pass over every partition, in partition order
    pub async fn poll_once(&self, shutdown: &mut watch::Receiver<bool>) -> Result<PollResult> {
        let ctx = &self.context;
        let partitions = ctx.broker.partitions(&ctx.config.topic).await?;

        let mut total = PollResult::default();
        for partition in partitions {
            let result = Self::poll_partition(ctx, partition, shutdown).await?;
            total.fetched += result.fetched;
            total.advanced += result.advanced;
            total.held |= result.held;
        }
        Ok(total)
    }

    /// Fetch from the committed offset and handle records in order, stopping
    /// at the first record that cannot be settled
    async fn poll_partition(
        ctx: &ProcessingContext<P, B, S>,
        partition: i32,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<PollResult> {
        let topic = &ctx.config.topic;
        let position = ctx
            .broker
            .committed(&ctx.config.group_id, topic, partition)
            .await?
            .unwrap_or(0);

        let records = ctx
            .broker
            .fetch(topic, partition, position, ctx.config.batch_size)
            .await
            .map_err(|e| ProcessorError::FetchFailed(e.to_string()))?;

        let mut result = PollResult {
            fetched: records.len(),
            ..Default::default()
        };

        for record in &records {
            match Self::handle_record(ctx, record, shutdown).await? {
                Disposition::Advance => {
                    Self::commit(ctx, record).await;
                    result.advanced += 1;
                }
                Disposition::Hold => {
                    result.held = true;
                    break;
                }
            }
        }

        Ok(result)
    }

    async fn commit(ctx: &ProcessingContext<P, B, S>, record: &ConsumerRecord) {
        let next = record.offset + 1;
        match ctx
            .broker
            .commit(&ctx.config.group_id, &record.topic, record.partition, next)
            .await
        {
            Ok(()) => {
                trace!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = next,
                    "Committed offset"
                );
                ctx.send_monitoring_event(ProcessingEvent::commit(
                    &record.topic,
                    record.partition,
                    record.offset,
                    true,
                    None,
                ))
                .await;
            }
            Err(e) => {
                // The record will be redelivered on the next poll
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to commit offset"
                );
                ctx.send_monitoring_event(ProcessingEvent::commit(
                    &record.topic,
                    record.partition,
                    record.offset,
                    false,
                    Some(e.to_string()),
                ))
                .await;
            }
        }
    }

    /// Apply the full failure protocol to one record
    pub async fn handle(
        &self,
        record: &ConsumerRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Disposition> {
        Self::handle_record(&self.context, record, shutdown).await
    }

    async fn handle_record(
        ctx: &ProcessingContext<P, B, S>,
        record: &ConsumerRecord,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<Disposition> {
        let mut retry = RetryHandle::new(ctx.backoff.clone(), ctx.classifier.clone());
        let outcome = retry
            .retry(|attempt| Self::attempt(ctx, record, attempt), shutdown)
            .await?;

        match outcome {
            RetryOutcome::Succeeded { attempts, .. } => {
                debug!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    attempts,
                    "Record processed successfully"
                );
                Ok(Disposition::Advance)
            }
            RetryOutcome::Ignored { error, .. } => {
                info!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %error,
                    "Ignoring failed record"
                );
                ctx.send_monitoring_event(ProcessingEvent::record_ignored(
                    &record.topic,
                    record.partition,
                    record.offset,
                    error.message(),
                ))
                .await;
                Ok(Disposition::Advance)
            }
            RetryOutcome::Failed {
                error,
                classification,
                attempts,
                exhausted,
            } => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    attempts,
                    exhausted,
                    kind = classification.kind.as_str(),
                    error = %error,
                    "Giving up on record"
                );
                Ok(Self::recover(ctx, record, &classification, &error).await)
            }
        }
    }

    async fn attempt(
        ctx: &ProcessingContext<P, B, S>,
        record: &ConsumerRecord,
        attempt: u32,
    ) -> std::result::Result<(), ProcessingError> {
        let started = Instant::now();
        let timeout = ctx.config.processing_timeout;

        let result = match tokio::time::timeout(timeout, ctx.processor.process(record)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    timeout = ?timeout,
                    "Record processing timed out"
                );
                Err(ProcessingError::recoverable(ProcessorError::ProcessingTimeout(timeout)))
            }
        };

        let (error, is_final_attempt) = match &result {
            Ok(()) => (None, false),
            Err(e) => {
                let kind = ctx.classifier.classify(e).kind;
                let last = kind != Classification::Retryable || attempt >= ctx.backoff.max_attempts();
                (Some(e.message()), last)
            }
        };

        ctx.send_monitoring_event(ProcessingEvent::record_attempt(
            &record.topic,
            record.partition,
            record.offset,
            result.is_ok(),
            attempt,
            started.elapsed(),
            error,
            is_final_attempt,
        ))
        .await;

        result
    }

    /// Route the record and persist a failure row. The lane advances if
    /// either step succeeded.
    async fn recover(
        ctx: &ProcessingContext<P, B, S>,
        record: &ConsumerRecord,
        classification: &ClassificationResult,
        error: &ProcessingError,
    ) -> Disposition {
        let routed = match ctx.router.route(record, classification, error).await {
            Ok(routed) => {
                ctx.send_monitoring_event(ProcessingEvent::record_routed(
                    &record.topic,
                    record.partition,
                    record.offset,
                    routed.target,
                    routed.metadata.topic,
                ))
                .await;
                true
            }
            Err(e) => {
                ctx.send_monitoring_event(ProcessingEvent::routing_failure(
                    &record.topic,
                    record.partition,
                    record.offset,
                    e.to_string(),
                ))
                .await;
                false
            }
        };

        let status = match classification.kind {
            Classification::Retryable => FailureStatus::Retry,
            _ => FailureStatus::Dead,
        };
        let row = NewFailureRecord::from_consumer_record(record, error.message(), status);

        let persisted = match ctx.store.insert(row).await {
            Ok(saved) => {
                debug!(
                    id = %saved.id,
                    status = %saved.status,
                    offset = record.offset,
                    "Persisted failure record"
                );
                ctx.send_monitoring_event(ProcessingEvent::failure_persisted(
                    &record.topic,
                    record.partition,
                    record.offset,
                    saved.id,
                    saved.status,
                ))
                .await;
                true
            }
            Err(e) => {
                error!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Failed to persist failure record"
                );
                ctx.send_monitoring_event(ProcessingEvent::store_failure(
                    &record.topic,
                    Some(record.partition),
                    Some(record.offset),
                    e.to_string(),
                ))
                .await;
                false
            }
        };

        if routed || persisted {
            Disposition::Advance
        } else {
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Record neither routed nor persisted, holding lane"
            );
            ctx.send_monitoring_event(ProcessingEvent::record_held(
                &record.topic,
                record.partition,
                record.offset,
            ))
            .await;
            Disposition::Hold
        }
    }
}
