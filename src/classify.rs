//! Failure classification
//!
//! Every failure reported by the business handler is mapped to one of three
//! actions by an ordered predicate table. Ignorable rules are evaluated
//! first, then the classification rules in order; the first match wins and
//! anything unmatched is treated as non-retryable so a poisoned record ends
//! up on the dead-letter topic instead of being retried forever.

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::{Cause, ProcessingError};

/// What the pipeline does with a failed record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    /// Retry in-process with backoff, then hand to the retry topic
    Retryable,
    /// Dead-letter immediately, no retry
    NonRetryable,
    /// Log and discard
    Ignorable,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Retryable => "retryable",
            Classification::NonRetryable => "non_retryable",
            Classification::Ignorable => "ignorable",
        }
    }
}

/// Output of [`ErrorClassifier::classify`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationResult {
    pub kind: Classification,
    pub cause: Cause,
    pub message: String,
}

/// Predicate over a processing failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseMatcher {
    /// Matches a cause category
    Cause(Cause),
    /// Matches when the failure message contains the text
    MessageContains(String),
}

impl CauseMatcher {
    pub fn matches(&self, error: &ProcessingError) -> bool {
        match self {
            CauseMatcher::Cause(cause) => error.cause() == *cause,
            CauseMatcher::MessageContains(text) => error.message().contains(text.as_str()),
        }
    }
}

/// One row of the predicate table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub when: CauseMatcher,
    pub kind: Classification,
}

impl ClassificationRule {
    pub fn new(when: CauseMatcher, kind: Classification) -> Self {
        Self { when, kind }
    }
}

/// Classifier section of the pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Causes that are logged and dropped
    pub ignore: Vec<CauseMatcher>,
    /// Ordered classification table
    pub rules: Vec<ClassificationRule>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            ignore: Vec::new(),
            rules: vec![
                ClassificationRule::new(
                    CauseMatcher::Cause(Cause::Recoverable),
                    Classification::Retryable,
                ),
                ClassificationRule::new(
                    CauseMatcher::Cause(Cause::Validation),
                    Classification::NonRetryable,
                ),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    ignore: Vec<CauseMatcher>,
    rules: Vec<ClassificationRule>,
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::from_config(&ClassifierConfig::default())
    }
}

impl ErrorClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &ClassifierConfig) -> Self {
        Self {
            ignore: config.ignore.clone(),
            rules: config.rules.clone(),
        }
    }

    /// Add a cause to the ignore allow-list
    pub fn ignore(mut self, matcher: CauseMatcher) -> Self {
        self.ignore.push(matcher);
        self
    }

    /// Add a rule ahead of the existing table
    pub fn with_rule(mut self, rule: ClassificationRule) -> Self {
        self.rules.insert(0, rule);
        self
    }

    pub fn classify(&self, error: &ProcessingError) -> ClassificationResult {
        let kind = if self.ignore.iter().any(|m| m.matches(error)) {
            Classification::Ignorable
        } else {
            self.rules
                .iter()
                .find(|rule| rule.when.matches(error))
                .map(|rule| rule.kind)
                .unwrap_or(Classification::NonRetryable)
        };

        trace!(cause = %error.cause(), kind = kind.as_str(), "Classified processing failure");

        ClassificationResult {
            kind,
            cause: error.cause(),
            message: error.message(),
        }
    }
}
