//! Library Events Consumer - event stream consumption with bounded retry
//!
//! This crate consumes a keyed, partitioned event stream and settles every
//! record that business processing rejects: in-process retries with backoff,
//! hand-off to a retry or dead-letter topic, a durable failure row, and a
//! periodic reconciliation sweep over rows still marked for retry.

pub mod broker;
pub mod classify;
pub mod config;
pub mod consumer;
pub mod error;
pub mod library;
pub mod monitoring;
pub mod pipeline;
pub mod retry;
pub mod router;
pub mod scheduler;
pub mod store;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;
#[cfg(test)]
mod tests;

pub use error::{Cause, ProcessingError, ProcessorError, Result, RoutingError, StoreError};
pub use retry::{Backoff, BackoffPolicy, ExponentialBackoff, FixedBackoff};

// Re-export main traits
pub use crate::broker::BrokerClient;
pub use crate::consumer::RecordProcessor;
pub use crate::store::FailureStore;

pub use crate::broker::{ConsumerRecord, Headers, InMemoryBroker, ProducerRecord, RecordMetadata};
pub use crate::classify::{Classification, ClassifierConfig, ErrorClassifier};
pub use crate::config::{ConfigError, PipelineConfig};
pub use crate::consumer::{Consumer, ConsumerConfig, Disposition};
pub use crate::library::{LibraryEvent, LibraryEventType, LibraryEventsService};
pub use crate::pipeline::Pipeline;
pub use crate::router::{DeadLetterRouter, RouterConfig, TopicsConfig};
pub use crate::scheduler::{ReconciliationScheduler, SchedulerConfig, SweepReport};
pub use crate::store::{FailureRecord, FailureStatus, InMemoryFailureStore, NewFailureRecord};

#[cfg(feature = "dynamodb-store")]
pub use crate::store::DynamoDbFailureStore;
