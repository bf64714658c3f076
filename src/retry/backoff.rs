use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Verdict of a backoff policy after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delay {
    /// Wait this long, then attempt again
    Wait(Duration),
    /// The attempt budget is spent
    Exhausted,
}

/// Trait defining backoff behavior
///
/// `attempt` is 1-based and names the attempt that just failed. The budget
/// returned by [`Backoff::max_attempts`] counts the first attempt, so a budget
/// of 2 allows exactly one retry.
pub trait Backoff: Send + Sync + Debug {
    /// Calculate the delay before the next attempt
    fn next_delay(&self, attempt: u32) -> Delay;

    /// Total attempts allowed, including the first
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff capped at `max_delay`, with optional jitter
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
    max_attempts: u32,
}

impl ExponentialBackoff {
    pub fn new(initial_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Create a new builder for ExponentialBackoff
    pub fn builder() -> ExponentialBackoffBuilder {
        ExponentialBackoffBuilder::default()
    }

    fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let exp_delay = base * self.multiplier.powi(exponent);

        // Cap at max_delay BEFORE adding jitter
        let max = self.max_delay.as_millis() as f64;
        let capped_delay = exp_delay.min(max);

        let final_delay = if self.jitter_factor > 0.0 {
            let jitter_range = capped_delay * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-jitter_range..=jitter_range);
            (capped_delay + jitter).clamp(0.0, max)
        } else {
            capped_delay
        };

        trace!(
            attempt = attempt,
            base_delay_ms = capped_delay,
            final_delay_ms = final_delay,
            "Calculated backoff delay"
        );

        Duration::from_millis(final_delay as u64)
    }
}

impl Backoff for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Delay {
        if attempt >= self.max_attempts {
            return Delay::Exhausted;
        }
        Delay::Wait(self.calculate_delay(attempt))
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Builder for ExponentialBackoff
#[derive(Debug)]
pub struct ExponentialBackoffBuilder {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter_factor: f64,
    max_attempts: u32,
}

impl Default for ExponentialBackoffBuilder {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(2000),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 3,
        }
    }
}

impl ExponentialBackoffBuilder {
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier.max(1.0);
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn build(self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            jitter_factor: self.jitter_factor,
            max_attempts: self.max_attempts,
        }
    }
}

/// Fixed backoff implementation
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
    max_attempts: u32,
}

impl FixedBackoff {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Backoff for FixedBackoff {
    fn next_delay(&self, attempt: u32) -> Delay {
        if attempt >= self.max_attempts {
            return Delay::Exhausted;
        }
        trace!(attempt = attempt, delay_ms = ?self.delay.as_millis(), "Fixed backoff delay");
        Delay::Wait(self.delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

/// Configuration form of a backoff policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    Fixed {
        delay_ms: u64,
        max_attempts: u32,
    },
    Exponential {
        initial_delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
        max_attempts: u32,
        #[serde(default)]
        jitter_factor: f64,
    },
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Fixed {
            delay_ms: 1000,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            BackoffPolicy::Fixed { max_attempts, .. }
            | BackoffPolicy::Exponential { max_attempts, .. } => *max_attempts,
        }
    }

    pub fn build(&self) -> Arc<dyn Backoff> {
        match self {
            BackoffPolicy::Fixed {
                delay_ms,
                max_attempts,
            } => Arc::new(FixedBackoff::new(
                Duration::from_millis(*delay_ms),
                *max_attempts,
            )),
            BackoffPolicy::Exponential {
                initial_delay_ms,
                multiplier,
                max_delay_ms,
                max_attempts,
                jitter_factor,
            } => Arc::new(
                ExponentialBackoff::builder()
                    .initial_delay(Duration::from_millis(*initial_delay_ms))
                    .max_delay(Duration::from_millis(*max_delay_ms))
                    .multiplier(*multiplier)
                    .jitter_factor(*jitter_factor)
                    .max_attempts(*max_attempts)
                    .build(),
            ),
        }
    }
}
