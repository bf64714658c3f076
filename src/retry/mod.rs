//! Retry and backoff functionality for the consumer
//!
//! [`RetryHandle`] drives the in-process retry loop for a single record. It
//! owns the transient [`RetryAttempt`] counter, consults the classifier after
//! every failure and the backoff policy after every retryable failure, and
//! sleeps only the task that called it.

mod backoff;
mod error;

pub use backoff::{
    Backoff, BackoffPolicy, Delay, ExponentialBackoff, ExponentialBackoffBuilder, FixedBackoff,
};
pub use error::RetryError;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use crate::classify::{Classification, ClassificationResult, ErrorClassifier};
use crate::error::ProcessingError;

/// In-memory attempt state for one record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    pub next_delay: Option<Duration>,
}

/// How a retry loop ended
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded {
        value: T,
        attempts: u32,
    },
    Ignored {
        error: ProcessingError,
        classification: ClassificationResult,
        attempts: u32,
    },
    /// Non-retryable, or retryable with the budget spent
    Failed {
        error: ProcessingError,
        classification: ClassificationResult,
        attempts: u32,
        exhausted: bool,
    },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Ignored { attempts, .. }
            | RetryOutcome::Failed { attempts, .. } => *attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Succeeded { .. })
    }
}

/// Helper for retrying operations with backoff
pub struct RetryHandle {
    backoff: Arc<dyn Backoff>,
    classifier: Arc<ErrorClassifier>,
    attempt: RetryAttempt,
}

impl RetryHandle {
    pub fn new(backoff: Arc<dyn Backoff>, classifier: Arc<ErrorClassifier>) -> Self {
        Self {
            backoff,
            classifier,
            attempt: RetryAttempt::default(),
        }
    }

    /// Run `operation` until it succeeds, is classified out of retrying, or
    /// exhausts the attempt budget. The closure receives the 1-based attempt
    /// number.
    pub async fn retry<F, Fut, T>(
        &mut self,
        mut operation: F,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<RetryOutcome<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ProcessingError>>,
    {
        loop {
            self.attempt.attempt_number += 1;
            self.attempt.next_delay = None;
            let attempt = self.attempt.attempt_number;
            trace!(attempt = attempt, "Executing operation");

            let result = select! {
                result = operation(attempt) => result,
                _ = shutdown_requested(shutdown) => {
                    debug!("Operation interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            };

            let error = match result {
                Ok(value) => {
                    debug!(attempts = attempt, "Operation succeeded");
                    return Ok(RetryOutcome::Succeeded {
                        value,
                        attempts: attempt,
                    });
                }
                Err(e) => e,
            };

            let classification = self.classifier.classify(&error);
            match classification.kind {
                Classification::Ignorable => {
                    return Ok(RetryOutcome::Ignored {
                        error,
                        classification,
                        attempts: attempt,
                    });
                }
                Classification::NonRetryable => {
                    return Ok(RetryOutcome::Failed {
                        error,
                        classification,
                        attempts: attempt,
                        exhausted: false,
                    });
                }
                Classification::Retryable => {}
            }

            let delay = match self.backoff.next_delay(attempt) {
                Delay::Wait(delay) => delay,
                Delay::Exhausted => {
                    warn!(
                        attempts = attempt,
                        error = %error,
                        "Maximum retry attempts exceeded"
                    );
                    return Ok(RetryOutcome::Failed {
                        error,
                        classification,
                        attempts: attempt,
                        exhausted: true,
                    });
                }
            };

            self.attempt.next_delay = Some(delay);
            warn!(
                attempt = attempt,
                delay_ms = ?delay.as_millis(),
                error = %error,
                "Operation failed, retrying after delay"
            );

            select! {
                _ = tokio::time::sleep(delay) => continue,
                _ = shutdown_requested(shutdown) => {
                    debug!("Retry interrupted by shutdown signal");
                    return Err(RetryError::Interrupted);
                }
            }
        }
    }

    /// Reset the attempt counter
    pub fn reset(&mut self) {
        self.attempt = RetryAttempt::default();
    }

    /// Get the current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempt.attempt_number
    }

    pub fn current_attempt(&self) -> RetryAttempt {
        self.attempt
    }
}

/// Resolves once the shutdown flag is set. A dropped sender never resolves.
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
