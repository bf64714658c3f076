//! Reconciliation scheduler
//!
//! On a fixed period the scheduler replays every failure row still in
//! `RETRY` through business processing. Each row is claimed with a
//! compare-and-set to `SKIPPED` before it is processed, so a row is attempted
//! at most once even when sweeps overlap. The row stays `SKIPPED` whether or
//! not the replay succeeds; a failed replay records its error text.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::duration_ms;
use crate::consumer::RecordProcessor;
use crate::error::StoreError;
use crate::monitoring::ProcessingEvent;
use crate::retry::shutdown_requested;
use crate::store::{FailureRecord, FailureStatus, FailureStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub enabled: bool,
    #[serde(rename = "period_ms", with = "duration_ms")]
    pub period: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            period: Duration::from_secs(15),
        }
    }
}

/// Counters for one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows returned by the RETRY query
    pub scanned: usize,
    /// Claimed rows whose replay succeeded
    pub recovered: usize,
    /// Claimed rows whose replay failed
    pub failed: usize,
    /// Rows another sweep claimed first
    pub lost_races: usize,
    /// Rows abandoned because a store call failed
    pub store_errors: usize,
}

impl SweepReport {
    pub fn attempted(&self) -> usize {
        self.recovered + self.failed
    }
}

pub struct ReconciliationScheduler<P, S> {
    processor: Arc<P>,
    store: Arc<S>,
    config: SchedulerConfig,
    monitoring_tx: Option<mpsc::Sender<ProcessingEvent>>,
}

impl<P, S> ReconciliationScheduler<P, S>
where
    P: RecordProcessor + 'static,
    S: FailureStore + 'static,
{
    pub fn new(processor: Arc<P>, store: Arc<S>, config: SchedulerConfig) -> Self {
        Self {
            processor,
            store,
            config,
            monitoring_tx: None,
        }
    }

    pub fn with_monitoring(mut self, tx: mpsc::Sender<ProcessingEvent>) -> Self {
        self.monitoring_tx = Some(tx);
        self
    }

    /// Sweep every period until shutdown. The first sweep runs one full
    /// period after start.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Reconciliation scheduler disabled");
            return;
        }

        info!(period_ms = self.config.period.as_millis() as u64, "Starting reconciliation scheduler");

        let start = Instant::now() + self.config.period;
        let mut interval = tokio::time::interval_at(start, self.config.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(report) => debug!(?report, "Sweep finished"),
                        Err(e) => error!(error = %e, "Reconciliation sweep skipped"),
                    }
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Reconciliation scheduler shutting down");
                    return;
                }
            }
        }
    }

    /// One pass over the RETRY rows. Only a failed query aborts the sweep.
    pub async fn sweep(&self) -> Result<SweepReport, StoreError> {
        let started = Instant::now();
        let pending = self.store.find_by_status(FailureStatus::Retry).await.map_err(|e| {
            warn!(error = %e, "Failed to query failure records");
            e
        })?;

        let mut report = SweepReport {
            scanned: pending.len(),
            ..Default::default()
        };

        for row in &pending {
            self.reconcile(row, &mut report).await;
        }

        if report.scanned > 0 {
            info!(
                scanned = report.scanned,
                recovered = report.recovered,
                failed = report.failed,
                lost_races = report.lost_races,
                store_errors = report.store_errors,
                duration_ms = started.elapsed().as_millis() as u64,
                "Reconciliation sweep complete"
            );
        }

        if let Some(tx) = &self.monitoring_tx {
            let topic = pending
                .first()
                .map(|r| r.source_topic.as_str())
                .unwrap_or_default();
            let event = ProcessingEvent::reconciliation_complete(
                topic,
                report.scanned,
                report.recovered,
                report.failed,
                report.lost_races,
                report.store_errors,
                started.elapsed(),
            );
            if let Err(e) = tx.send(event).await {
                warn!(error = %e, "Failed to send monitoring event");
            }
        }

        Ok(report)
    }

    async fn reconcile(&self, row: &FailureRecord, report: &mut SweepReport) {
        match self
            .store
            .transition(row.id, FailureStatus::Retry, FailureStatus::Skipped)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                debug!(id = %row.id, "Failure record already claimed");
                report.lost_races += 1;
                return;
            }
            Err(e) => {
                error!(id = %row.id, error = %e, "Failed to claim failure record");
                report.store_errors += 1;
                return;
            }
        }

        let record = row.to_consumer_record();
        match self.processor.process(&record).await {
            Ok(()) => {
                info!(
                    id = %row.id,
                    topic = %row.source_topic,
                    offset = row.offset,
                    "Reconciled failure record"
                );
                report.recovered += 1;
            }
            Err(e) => {
                warn!(
                    id = %row.id,
                    topic = %row.source_topic,
                    offset = row.offset,
                    error = %e,
                    "Reconciliation attempt failed"
                );
                report.failed += 1;
                if let Err(store_err) = self.store.update_error_message(row.id, &e.message()).await {
                    error!(id = %row.id, error = %store_err, "Failed to record reconciliation error");
                    report.store_errors += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::ConsumerRecord;
    use crate::store::{InMemoryFailureStore, NewFailureRecord};
    use crate::test::mocks::MockRecordProcessor;
    use bytes::Bytes;
    use pretty_assertions::assert_eq;

    async fn seed(store: &InMemoryFailureStore, offset: i64, status: FailureStatus) -> FailureRecord {
        let record = ConsumerRecord::new("library-events", 0, offset, None, Bytes::from("payload"));
        store
            .insert(NewFailureRecord::from_consumer_record(&record, "first failure", status))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_sweep_claims_and_skips_regardless_of_outcome() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryFailureStore::new());
        let ok = seed(&store, 1, FailureStatus::Retry).await;
        let bad = seed(&store, 2, FailureStatus::Retry).await;
        let dead = seed(&store, 3, FailureStatus::Dead).await;

        let processor = Arc::new(MockRecordProcessor::new());
        processor.fail_offset_recoverable(2, "still down").await;

        let scheduler = ReconciliationScheduler::new(processor.clone(), store.clone(), SchedulerConfig::default());
        let report = scheduler.sweep().await?;

        assert_eq!(
            report,
            SweepReport {
                scanned: 2,
                recovered: 1,
                failed: 1,
                lost_races: 0,
                store_errors: 0,
            }
        );
        assert_eq!(processor.get_process_count(), 2);

        let ok = store.get(ok.id).await?.unwrap();
        assert_eq!(ok.status, FailureStatus::Skipped);
        assert_eq!(ok.last_error_message, "first failure");

        let bad = store.get(bad.id).await?.unwrap();
        assert_eq!(bad.status, FailureStatus::Skipped);
        assert_eq!(bad.last_error_message, "still down");

        assert_eq!(store.get(dead.id).await?.unwrap().status, FailureStatus::Dead);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_sweep_is_a_no_op() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryFailureStore::new());
        seed(&store, 1, FailureStatus::Retry).await;
        seed(&store, 2, FailureStatus::Dead).await;

        let processor = Arc::new(MockRecordProcessor::new());
        let scheduler = ReconciliationScheduler::new(processor.clone(), store, SchedulerConfig::default());

        scheduler.sweep().await?;
        assert_eq!(processor.get_process_count(), 1);

        let report = scheduler.sweep().await?;
        assert_eq!(report, SweepReport::default());
        assert_eq!(processor.get_process_count(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sweeps_on_period() -> anyhow::Result<()> {
        let store = Arc::new(InMemoryFailureStore::new());
        let row = seed(&store, 1, FailureStatus::Retry).await;
        let processor = Arc::new(MockRecordProcessor::new());

        let scheduler = ReconciliationScheduler::new(processor.clone(), store.clone(), SchedulerConfig::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move { scheduler.run(shutdown_rx).await });

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert_eq!(processor.get_process_count(), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(processor.get_process_count(), 1);
        assert_eq!(store.get(row.id).await?.unwrap().status, FailureStatus::Skipped);

        shutdown_tx.send(true)?;
        handle.await?;
        Ok(())
    }
}
