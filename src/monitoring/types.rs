use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::duration_ms;
use crate::router::RouteTarget;
use crate::store::FailureStatus;

#[cfg(any(test, feature = "test-utils"))]
use {
    std::collections::HashSet,
    std::sync::Arc,
    tokio::sync::{mpsc, Mutex},
    tracing::debug,
};

/// Configuration for the monitoring system
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Whether monitoring is enabled
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often to emit aggregated metrics
    #[serde(rename = "metrics_interval_ms", with = "duration_ms")]
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// A monitoring event from a consumer or the reconciliation scheduler
#[derive(Debug, Clone)]
pub struct ProcessingEvent {
    /// When the event occurred
    pub timestamp: SystemTime,
    /// Topic the event relates to
    pub topic: String,
    /// Partition lane, `None` for scheduler events
    pub partition: Option<i32>,
    /// The type of event and its details
    pub event_type: ProcessingEventType,
}

#[derive(Debug, Clone)]
pub enum ProcessingEventType {
    RecordAttempt {
        offset: i64,
        success: bool,
        attempt_number: u32,
        duration: Duration,
        error: Option<String>,
        is_final_attempt: bool,
    },
    RecordIgnored {
        offset: i64,
        error: String,
    },
    RecordRouted {
        offset: i64,
        target: RouteTarget,
        destination: String,
    },
    RoutingFailure {
        offset: i64,
        error: String,
    },
    FailurePersisted {
        offset: i64,
        id: Uuid,
        status: FailureStatus,
    },
    StoreFailure {
        offset: Option<i64>,
        error: String,
    },
    /// Neither routing nor persistence succeeded; the lane stays on this offset
    RecordHeld {
        offset: i64,
    },
    Commit {
        offset: i64,
        success: bool,
        error: Option<String>,
    },
    LaneEvent {
        event_type: LaneEventType,
        details: Option<String>,
    },
    ReconciliationComplete {
        scanned: usize,
        recovered: usize,
        failed: usize,
        lost_races: usize,
        store_errors: usize,
        duration: Duration,
    },
}

/// Types of partition-lane events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneEventType {
    /// Started consuming a partition
    Started,
    /// Error while fetching or committing
    Error,
    /// Lane stopped by shutdown
    Interrupted,
}

impl ProcessingEvent {
    fn new(topic: &str, partition: Option<i32>, event_type: ProcessingEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            topic: topic.to_string(),
            partition,
            event_type,
        }
    }

    pub fn record_attempt(
        topic: &str,
        partition: i32,
        offset: i64,
        success: bool,
        attempt_number: u32,
        duration: Duration,
        error: Option<String>,
        is_final_attempt: bool,
    ) -> Self {
        Self::new(
            topic,
            Some(partition),
            ProcessingEventType::RecordAttempt {
                offset,
                success,
                attempt_number,
                duration,
                error,
                is_final_attempt,
            },
        )
    }

    pub fn record_ignored(topic: &str, partition: i32, offset: i64, error: String) -> Self {
        Self::new(
            topic,
            Some(partition),
            ProcessingEventType::RecordIgnored { offset, error },
        )
    }

    pub fn record_routed(
        topic: &str,
        partition: i32,
        offset: i64,
        target: RouteTarget,
        destination: String,
    ) -> Self {
        Self::new(
            topic,
            Some(partition),
            ProcessingEventType::RecordRouted {
                offset,
                target,
                destination,
            },
        )
    }

    pub fn routing_failure(topic: &str, partition: i32, offset: i64, error: String) -> Self {
        Self::new(
            topic,
            Some(partition),
            ProcessingEventType::RoutingFailure { offset, error },
        )
    }

    pub fn failure_persisted(
        topic: &str,
        partition: i32,
        offset: i64,
        id: Uuid,
        status: FailureStatus,
    ) -> Self {
        Self::new(
            topic,
            Some(partition),
            ProcessingEventType::FailurePersisted { offset, id, status },
        )
    }

    pub fn store_failure(
        topic: &str,
        partition: Option<i32>,
        offset: Option<i64>,
        error: String,
    ) -> Self {
        Self::new(
            topic,
            partition,
            ProcessingEventType::StoreFailure { offset, error },
        )
    }

    pub fn record_held(topic: &str, partition: i32, offset: i64) -> Self {
        Self::new(topic, Some(partition), ProcessingEventType::RecordHeld { offset })
    }

    pub fn commit(
        topic: &str,
        partition: i32,
        offset: i64,
        success: bool,
        error: Option<String>,
    ) -> Self {
        Self::new(
            topic,
            Some(partition),
            ProcessingEventType::Commit {
                offset,
                success,
                error,
            },
        )
    }

    pub fn lane_event(
        topic: &str,
        partition: i32,
        event_type: LaneEventType,
        details: Option<String>,
    ) -> Self {
        Self::new(
            topic,
            Some(partition),
            ProcessingEventType::LaneEvent {
                event_type,
                details,
            },
        )
    }

    pub fn reconciliation_complete(
        topic: &str,
        scanned: usize,
        recovered: usize,
        failed: usize,
        lost_races: usize,
        store_errors: usize,
        duration: Duration,
    ) -> Self {
        Self::new(
            topic,
            None,
            ProcessingEventType::ReconciliationComplete {
                scanned,
                recovered,
                failed,
                lost_races,
                store_errors,
                duration,
            },
        )
    }
}

// Test-only code
#[cfg(any(test, feature = "test-utils"))]
#[derive(Debug)]
pub struct TestMonitoringHarness {
    pub monitoring_rx: mpsc::Receiver<ProcessingEvent>,
    events_seen: Arc<Mutex<HashSet<String>>>,
    event_history: Arc<Mutex<Vec<ProcessingEvent>>>,
}

#[cfg(any(test, feature = "test-utils"))]
impl TestMonitoringHarness {
    pub fn new(monitoring_rx: mpsc::Receiver<ProcessingEvent>) -> Self {
        Self {
            monitoring_rx,
            events_seen: Arc::new(Mutex::new(HashSet::new())),
            event_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Wait until every key in `expected_events` has been seen
    pub async fn wait_for_events(&mut self, expected_events: &[&str]) -> anyhow::Result<()> {
        let timeout = Duration::from_secs(5);

        let wait = async {
            while let Some(event) = self.monitoring_rx.recv().await {
                self.process_event(&event).await;

                let events = self.events_seen.lock().await;
                if expected_events.iter().all(|e| events.contains(*e)) {
                    debug!("All expected events seen: {:?}", expected_events);
                    return true;
                }
            }
            false
        };

        let seen_all = tokio::time::timeout(timeout, wait).await;
        match seen_all {
            Ok(true) => Ok(()),
            Ok(false) => Err(anyhow::anyhow!(
                "Channel closed before seeing all events. Expected: {:?}, Seen: {:?}",
                expected_events,
                self.events_seen.lock().await
            )),
            Err(_) => Err(anyhow::anyhow!(
                "Timeout waiting for events. Expected: {:?}, Seen: {:?}",
                expected_events,
                self.events_seen.lock().await
            )),
        }
    }

    /// Drain whatever is already buffered without waiting
    pub async fn drain(&mut self) {
        while let Ok(event) = self.monitoring_rx.try_recv() {
            self.process_event(&event).await;
        }
    }

    async fn process_event(&self, event: &ProcessingEvent) {
        let mut events = self.events_seen.lock().await;
        let mut history = self.event_history.lock().await;

        history.push(event.clone());

        match &event.event_type {
            ProcessingEventType::RecordAttempt {
                offset,
                success,
                attempt_number,
                is_final_attempt,
                ..
            } => {
                let status = if *success { "success" } else { "failure" };
                events.insert(format!("record_attempt_{}_{}", offset, status));
                events.insert(format!("record_attempt_{}_try_{}", offset, attempt_number));
                if *is_final_attempt {
                    events.insert(format!("record_final_attempt_{}", offset));
                }
            }
            ProcessingEventType::RecordIgnored { offset, .. } => {
                events.insert(format!("record_ignored_{}", offset));
            }
            ProcessingEventType::RecordRouted { offset, target, .. } => {
                events.insert(format!("record_routed_{}_{}", offset, target.as_str()));
            }
            ProcessingEventType::RoutingFailure { offset, .. } => {
                events.insert(format!("routing_failure_{}", offset));
            }
            ProcessingEventType::FailurePersisted { offset, status, .. } => {
                events.insert(format!("failure_persisted_{}_{}", offset, status));
            }
            ProcessingEventType::StoreFailure { offset, .. } => match offset {
                Some(offset) => {
                    events.insert(format!("store_failure_{}", offset));
                }
                None => {
                    events.insert("store_failure".to_string());
                }
            },
            ProcessingEventType::RecordHeld { offset } => {
                events.insert(format!("record_held_{}", offset));
            }
            ProcessingEventType::Commit {
                offset, success, ..
            } => {
                let status = if *success { "success" } else { "failure" };
                events.insert(format!("commit_{}_{}", offset, status));
            }
            ProcessingEventType::LaneEvent { event_type, .. } => {
                let partition = event.partition.unwrap_or_default();
                let name = match event_type {
                    LaneEventType::Started => "started",
                    LaneEventType::Error => "error",
                    LaneEventType::Interrupted => "interrupted",
                };
                events.insert(format!("lane_{}_{}", partition, name));
            }
            ProcessingEventType::ReconciliationComplete {
                scanned,
                recovered,
                failed,
                ..
            } => {
                events.insert("reconciliation_complete".to_string());
                events.insert(format!(
                    "reconciliation_complete_{}_{}_{}",
                    scanned, recovered, failed
                ));
            }
        }
    }

    /// Get all events seen so far
    pub async fn get_events_seen(&self) -> HashSet<String> {
        self.events_seen.lock().await.clone()
    }

    /// Get full event history
    pub async fn get_event_history(&self) -> Vec<ProcessingEvent> {
        self.event_history.lock().await.clone()
    }

    /// Check if a specific event has occurred
    pub async fn has_seen_event(&self, event: &str) -> bool {
        self.events_seen.lock().await.contains(event)
    }

    /// Get count of specific event type
    pub async fn get_event_count(&self, event_prefix: &str) -> usize {
        self.events_seen
            .lock()
            .await
            .iter()
            .filter(|e| e.starts_with(event_prefix))
            .count()
    }

    /// Dump event history for debugging
    pub async fn dump_history(&self) {
        let history = self.event_history.lock().await;
        debug!("=== Event History ===");
        for (i, event) in history.iter().enumerate() {
            debug!("[{}] {:?}", i, event);
        }
        debug!("=== End History ===");
    }
}
