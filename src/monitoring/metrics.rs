use super::types::{LaneEventType, ProcessingEvent, ProcessingEventType};
use std::collections::HashMap;

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Identifies one partition lane of one topic. Scheduler events carry no
/// partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LaneId {
    pub topic: String,
    pub partition: Option<i32>,
}

impl std::fmt::Display for LaneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.partition {
            Some(p) => write!(f, "{}-{}", self.topic, p),
            None => write!(f, "{}", self.topic),
        }
    }
}

/// Holds aggregated metrics for a single lane
#[derive(Debug, Clone)]
pub struct LaneMetrics {
    // Record processing metrics
    pub records_processed: u64,
    pub records_failed: u64,
    pub records_ignored: u64,
    pub records_held: u64,
    pub retry_attempts: u64,
    pub processing_time: Duration,

    // Failure pipeline
    pub routed_to_retry: u64,
    pub routed_to_dead_letter: u64,
    pub routing_failures: u64,
    pub failures_persisted: u64,
    pub store_failures: u64,

    // Offsets
    pub commits_succeeded: u64,
    pub commits_failed: u64,

    // Reconciliation
    pub sweeps: u64,
    pub reconciled_recovered: u64,
    pub reconciled_failed: u64,

    pub avg_processing_time: Duration,
    pub max_processing_time: Duration,

    pub window_start: Instant,
    pub last_updated: Instant,
}

impl Default for LaneMetrics {
    fn default() -> Self {
        let now = Instant::now();
        Self {
            records_processed: 0,
            records_failed: 0,
            records_ignored: 0,
            records_held: 0,
            retry_attempts: 0,
            processing_time: Duration::default(),
            routed_to_retry: 0,
            routed_to_dead_letter: 0,
            routing_failures: 0,
            failures_persisted: 0,
            store_failures: 0,
            commits_succeeded: 0,
            commits_failed: 0,
            sweeps: 0,
            reconciled_recovered: 0,
            reconciled_failed: 0,
            avg_processing_time: Duration::default(),
            max_processing_time: Duration::default(),
            window_start: now,
            last_updated: now,
        }
    }
}

/// Aggregates monitoring events into metrics
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<LaneId, LaneMetrics>>>,
    window_duration: Duration,
    monitoring_rx: tokio::sync::mpsc::Receiver<ProcessingEvent>,
}

impl MetricsAggregator {
    pub fn new(
        window_duration: Duration,
        monitoring_rx: tokio::sync::mpsc::Receiver<ProcessingEvent>,
    ) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Shared handle to the aggregated metrics, usable after `run` takes `self`
    pub fn metrics_handle(&self) -> Arc<RwLock<HashMap<LaneId, LaneMetrics>>> {
        self.metrics.clone()
    }

    /// Process events and emit metrics until every sender is dropped
    pub async fn run(mut self) {
        let mut interval = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => {
                        self.emit_metrics().await;
                        debug!("Monitoring channel closed, stopping metrics aggregation");
                        return;
                    }
                },

                _ = interval.tick() => {
                    self.emit_metrics().await;
                }
            }
        }
    }

    pub async fn process_event(&self, event: ProcessingEvent) {
        let lane = LaneId {
            topic: event.topic.clone(),
            partition: event.partition,
        };
        let mut metrics = self.metrics.write().await;
        let lane_metrics = metrics.entry(lane.clone()).or_default();

        match event.event_type {
            ProcessingEventType::RecordAttempt {
                success,
                attempt_number,
                duration,
                is_final_attempt,
                ..
            } => {
                if success {
                    lane_metrics.records_processed += 1;
                } else if is_final_attempt {
                    lane_metrics.records_failed += 1;
                }

                if attempt_number > 1 {
                    lane_metrics.retry_attempts += 1;
                }

                lane_metrics.processing_time += duration;
                let avg_count = lane_metrics.records_processed + lane_metrics.records_failed;
                if avg_count > 0 {
                    lane_metrics.avg_processing_time =
                        lane_metrics.processing_time.div_f64(avg_count as f64);
                }
                if duration > lane_metrics.max_processing_time {
                    lane_metrics.max_processing_time = duration;
                }
            }
            ProcessingEventType::RecordIgnored { offset, error } => {
                lane_metrics.records_ignored += 1;
                trace!(lane = %lane, offset, error = %error, "Record ignored");
            }
            ProcessingEventType::RecordRouted { target, .. } => match target {
                crate::router::RouteTarget::RetryTopic => lane_metrics.routed_to_retry += 1,
                crate::router::RouteTarget::DeadLetterTopic => {
                    lane_metrics.routed_to_dead_letter += 1
                }
            },
            ProcessingEventType::RoutingFailure { offset, error } => {
                lane_metrics.routing_failures += 1;
                warn!(lane = %lane, offset, error = %error, "Routing failed");
            }
            ProcessingEventType::FailurePersisted { .. } => {
                lane_metrics.failures_persisted += 1;
            }
            ProcessingEventType::StoreFailure { offset, error } => {
                lane_metrics.store_failures += 1;
                warn!(lane = %lane, offset = ?offset, error = %error, "Failure store operation failed");
            }
            ProcessingEventType::RecordHeld { offset } => {
                lane_metrics.records_held += 1;
                warn!(lane = %lane, offset, "Lane held on unrouted, unpersisted record");
            }
            ProcessingEventType::Commit { success, error, offset } => {
                if success {
                    lane_metrics.commits_succeeded += 1;
                } else {
                    lane_metrics.commits_failed += 1;
                    warn!(lane = %lane, offset, error = ?error, "Offset commit failed");
                }
            }
            ProcessingEventType::LaneEvent {
                event_type,
                details,
            } => match event_type {
                LaneEventType::Started => debug!(lane = %lane, "Lane started"),
                LaneEventType::Error => {
                    warn!(lane = %lane, details = ?details, "Lane error")
                }
                LaneEventType::Interrupted => {
                    info!(lane = %lane, details = ?details, "Lane interrupted")
                }
            },
            ProcessingEventType::ReconciliationComplete {
                recovered,
                failed,
                store_errors,
                ..
            } => {
                lane_metrics.sweeps += 1;
                lane_metrics.reconciled_recovered += recovered as u64;
                lane_metrics.reconciled_failed += failed as u64;
                lane_metrics.store_failures += store_errors as u64;
            }
        }

        lane_metrics.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let metrics = self.metrics.read().await;

        for (lane, metrics) in metrics.iter() {
            // Skip lanes with no recent activity
            if metrics.last_updated.elapsed() > self.window_duration * 2 {
                continue;
            }

            info!(
                lane = %lane,
                records_processed = metrics.records_processed,
                records_failed = metrics.records_failed,
                records_ignored = metrics.records_ignored,
                retry_attempts = metrics.retry_attempts,
                routed_to_retry = metrics.routed_to_retry,
                routed_to_dead_letter = metrics.routed_to_dead_letter,
                failures_persisted = metrics.failures_persisted,
                avg_processing_time_ms = %metrics.avg_processing_time.as_millis(),
                max_processing_time_ms = %metrics.max_processing_time.as_millis(),
                sweeps = metrics.sweeps,
                "Metrics for window"
            );

            if metrics.routing_failures > 0 || metrics.records_held > 0 {
                warn!(
                    lane = %lane,
                    routing_failures = metrics.routing_failures,
                    held = metrics.records_held,
                    "Failed records could not be routed"
                );
            }

            if metrics.store_failures > 0 {
                warn!(
                    lane = %lane,
                    failures = metrics.store_failures,
                    "Failure store errors detected"
                );
            }
        }
        drop(metrics);

        let mut metrics = self.metrics.write().await;
        metrics.retain(|_, m| m.last_updated.elapsed() <= self.window_duration * 2);
    }

    /// Get current metrics for all lanes
    pub async fn get_metrics(&self) -> HashMap<LaneId, LaneMetrics> {
        self.metrics.read().await.clone()
    }

    /// Get metrics for a specific lane
    pub async fn get_lane_metrics(&self, topic: &str, partition: Option<i32>) -> Option<LaneMetrics> {
        let lane = LaneId {
            topic: topic.to_string(),
            partition,
        };
        self.metrics.read().await.get(&lane).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouteTarget;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn test_aggregates_per_lane() {
        let (_tx, rx) = mpsc::channel(10);
        let aggregator = MetricsAggregator::new(Duration::from_secs(60), rx);

        for attempt in 1..=2 {
            aggregator
                .process_event(ProcessingEvent::record_attempt(
                    "library-events",
                    0,
                    4,
                    false,
                    attempt,
                    Duration::from_millis(10),
                    Some("Temporary network error".to_string()),
                    attempt == 2,
                ))
                .await;
        }
        aggregator
            .process_event(ProcessingEvent::record_routed(
                "library-events",
                0,
                4,
                RouteTarget::DeadLetterTopic,
                "library-events.DLT".to_string(),
            ))
            .await;
        aggregator
            .process_event(ProcessingEvent::record_attempt(
                "library-events",
                1,
                0,
                true,
                1,
                Duration::from_millis(5),
                None,
                false,
            ))
            .await;
        aggregator
            .process_event(ProcessingEvent::reconciliation_complete(
                "library-events",
                3,
                2,
                1,
                0,
                0,
                Duration::from_millis(20),
            ))
            .await;

        let lane0 = aggregator
            .get_lane_metrics("library-events", Some(0))
            .await
            .unwrap();
        assert_eq!(lane0.records_failed, 1);
        assert_eq!(lane0.retry_attempts, 1);
        assert_eq!(lane0.routed_to_dead_letter, 1);
        assert_eq!(lane0.max_processing_time, Duration::from_millis(10));

        let lane1 = aggregator
            .get_lane_metrics("library-events", Some(1))
            .await
            .unwrap();
        assert_eq!(lane1.records_processed, 1);

        let sweeps = aggregator
            .get_lane_metrics("library-events", None)
            .await
            .unwrap();
        assert_eq!(sweeps.sweeps, 1);
        assert_eq!(sweeps.reconciled_recovered, 2);
        assert_eq!(aggregator.get_metrics().await.len(), 3);
    }

    #[tokio::test]
    async fn test_run_stops_when_senders_drop() {
        let (tx, rx) = mpsc::channel(10);
        let aggregator = MetricsAggregator::new(Duration::from_secs(60), rx);
        let metrics = aggregator.metrics_handle();
        let handle = tokio::spawn(aggregator.run());

        tx.send(ProcessingEvent::record_held("library-events", 2, 9))
            .await
            .unwrap();
        drop(tx);

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        let lane = LaneId {
            topic: "library-events".to_string(),
            partition: Some(2),
        };
        assert_eq!(metrics.read().await.get(&lane).unwrap().records_held, 1);
    }
}
