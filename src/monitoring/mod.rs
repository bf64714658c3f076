//! Monitoring for the consumer pipeline
//!
//! Consumers and the reconciliation scheduler push [`ProcessingEvent`]s into
//! an optional bounded channel; [`MetricsAggregator`] folds them into
//! per-lane counters and logs them on an interval.

mod metrics;
mod types;

pub use metrics::{LaneId, LaneMetrics, MetricsAggregator};
#[cfg(any(test, feature = "test-utils"))]
pub use types::TestMonitoringHarness;
pub use types::{LaneEventType, MonitoringConfig, ProcessingEvent, ProcessingEventType};
