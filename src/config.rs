//! Pipeline configuration
//!
//! Configuration is TOML. String values may reference environment variables
//! as `${NAME}` or `${NAME:default}`; references are expanded before
//! parsing. Every duration is given in milliseconds.
//!
//! ```toml
//! [topics]
//! source = "library-events"
//!
//! [consumer]
//! group_id = "library-events-listener-group"
//! concurrency = 3
//!
//! [consumer.backoff]
//! kind = "fixed"
//! delay_ms = 1000
//! max_attempts = 3
//!
//! [retry_consumer]
//! enabled = ${RETRY_LISTENER_ENABLED:false}
//! ```

use std::path::Path;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

use crate::classify::ClassifierConfig;
use crate::consumer::ConsumerConfig;
use crate::monitoring::MonitoringConfig;
use crate::router::{RouterConfig, TopicsConfig};
use crate::scheduler::SchedulerConfig;

static ENV_REFERENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::([^}]*))?\}").expect("Invalid env reference pattern")
});

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Environment variable {0} is not set and has no default")]
    MissingVariable(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

impl From<ConfigError> for crate::error::ProcessorError {
    fn from(err: ConfigError) -> Self {
        crate::error::ProcessorError::ConfigError(err.to_string())
    }
}

/// Serde adapter for `Duration` fields written as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

fn default_retry_consumer() -> ConsumerConfig {
    ConsumerConfig {
        group_id: "retry-listener-group".to_string(),
        enabled: false,
        ..ConsumerConfig::default()
    }
}

/// A `[retry_consumer]` section overrides the retry defaults key by key
/// rather than falling back to the primary consumer's defaults.
fn deserialize_retry_consumer<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<ConsumerConfig, D::Error> {
    let overrides = toml::Table::deserialize(deserializer)?;
    let mut merged = match toml::Value::try_from(default_retry_consumer()).map_err(D::Error::custom)? {
        toml::Value::Table(table) => table,
        _ => return Err(D::Error::custom("retry consumer defaults are not a table")),
    };
    for (key, value) in overrides {
        merged.insert(key, value);
    }
    toml::Value::Table(merged).try_into().map_err(D::Error::custom)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub topics: TopicsConfig,
    pub consumer: ConsumerConfig,
    #[serde(deserialize_with = "deserialize_retry_consumer")]
    pub retry_consumer: ConsumerConfig,
    pub classifier: ClassifierConfig,
    pub router: RouterConfig,
    pub scheduler: SchedulerConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            topics: TopicsConfig::default(),
            consumer: ConsumerConfig::default(),
            retry_consumer: default_retry_consumer(),
            classifier: ClassifierConfig::default(),
            router: RouterConfig::default(),
            scheduler: SchedulerConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env(input)?;
        let config: PipelineConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.source.is_empty() {
            return Err(ConfigError::Invalid("topics.source must not be empty".to_string()));
        }
        let retry = self.topics.retry_topic();
        let dead_letter = self.topics.dead_letter_topic();
        if retry == self.topics.source || dead_letter == self.topics.source || retry == dead_letter {
            return Err(ConfigError::Invalid(
                "source, retry and dead-letter topics must be distinct".to_string(),
            ));
        }

        for (name, consumer) in [("consumer", &self.consumer), ("retry_consumer", &self.retry_consumer)] {
            if consumer.group_id.is_empty() {
                return Err(ConfigError::Invalid(format!("{}.group_id must not be empty", name)));
            }
            if consumer.concurrency == 0 || consumer.batch_size == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}.concurrency and {}.batch_size must be positive",
                    name, name
                )));
            }
            if consumer.backoff.max_attempts() == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{}.backoff.max_attempts must be at least 1",
                    name
                )));
            }
        }

        if self.consumer.enabled
            && self.retry_consumer.enabled
            && self.consumer.group_id == self.retry_consumer.group_id
        {
            return Err(ConfigError::Invalid(
                "consumer and retry_consumer need distinct group ids".to_string(),
            ));
        }

        if self.scheduler.period.is_zero() {
            return Err(ConfigError::Invalid("scheduler.period_ms must be positive".to_string()));
        }

        Ok(())
    }

    /// Primary consumer settings with the source topic and monitoring filled in
    pub fn primary_consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            topic: self.topics.source.clone(),
            monitoring: self.monitoring.clone(),
            ..self.consumer.clone()
        }
    }

    /// Retry-topic consumer settings with the retry topic and monitoring filled in
    pub fn retry_topic_consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            topic: self.topics.retry_topic(),
            monitoring: self.monitoring.clone(),
            ..self.retry_consumer.clone()
        }
    }
}

/// Expand `${NAME}` and `${NAME:default}` references
pub fn expand_env(input: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = ENV_REFERENCE.replace_all(input, |caps: &Captures<'_>| {
        let name = &caps[1];
        match (std::env::var(name), caps.get(2)) {
            (Ok(value), _) => value,
            (Err(_), Some(default)) => default.as_str().to_string(),
            (Err(_), None) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::MissingVariable(name)),
        None => Ok(expanded.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{CauseMatcher, Classification};
    use crate::retry::BackoffPolicy;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        config.validate().unwrap();

        let primary = config.primary_consumer();
        assert_eq!(primary.topic, "library-events");
        assert_eq!(primary.concurrency, 3);
        assert_eq!(primary.backoff.max_attempts(), 3);

        let retry = config.retry_topic_consumer();
        assert_eq!(retry.topic, "library-events.RETRY");
        assert_eq!(retry.group_id, "retry-listener-group");
        assert!(!retry.enabled);

        assert_eq!(config.topics.dead_letter_topic(), "library-events.DLT");
        assert_eq!(config.scheduler.period, Duration::from_secs(15));
    }

    #[test]
    fn test_full_document() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [topics]
            source = "orders"
            dead_letter = "orders-dead"

            [consumer]
            group_id = "orders-group"
            concurrency = 2
            processing_timeout_ms = 2000

            [consumer.backoff]
            kind = "exponential"
            initial_delay_ms = 100
            multiplier = 2.0
            max_delay_ms = 1000
            max_attempts = 4

            [retry_consumer]
            enabled = true

            [classifier]
            ignore = [{ message_contains = "duplicate" }]

            [router]
            publish_timeout_ms = 1500

            [scheduler]
            period_ms = 30000

            [monitoring]
            enabled = true
            "#,
        )
        .unwrap();

        assert_eq!(config.topics.retry_topic(), "orders.RETRY");
        assert_eq!(config.topics.dead_letter_topic(), "orders-dead");
        assert_eq!(config.consumer.concurrency, 2);
        assert_eq!(config.consumer.processing_timeout, Duration::from_secs(2));
        assert!(matches!(
            config.consumer.backoff,
            BackoffPolicy::Exponential { max_attempts: 4, .. }
        ));
        assert!(config.retry_consumer.enabled);
        assert_eq!(config.retry_consumer.group_id, "retry-listener-group");
        assert_eq!(
            config.classifier.ignore,
            vec![CauseMatcher::MessageContains("duplicate".to_string())]
        );
        assert_eq!(config.classifier.rules[0].kind, Classification::Retryable);
        assert_eq!(config.router.publish_timeout, Duration::from_millis(1500));
        assert_eq!(config.scheduler.period, Duration::from_secs(30));
        assert!(config.primary_consumer().monitoring.enabled);
    }

    #[test]
    fn test_env_interpolation() {
        std::env::set_var("LEC_TEST_SOURCE_TOPIC", "payments");
        let expanded = expand_env("source = \"${LEC_TEST_SOURCE_TOPIC}\"\nx = \"${LEC_TEST_UNSET_VAR:fallback}\"").unwrap();
        assert_eq!(expanded, "source = \"payments\"\nx = \"fallback\"");

        let err = expand_env("x = \"${LEC_TEST_UNSET_VAR}\"").unwrap_err();
        assert!(matches!(err, ConfigError::MissingVariable(ref name) if name == "LEC_TEST_UNSET_VAR"));
    }

    #[test]
    fn test_validation() {
        let err = PipelineConfig::from_toml_str(
            r#"
            [topics]
            source = "orders"
            retry = "orders"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = PipelineConfig::from_toml_str(
            r#"
            [consumer]
            concurrency = 0
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("concurrency"));

        let err = PipelineConfig::from_toml_str(
            r#"
            [retry_consumer]
            enabled = true
            group_id = "library-events-listener-group"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("distinct group ids"));

        assert!(matches!(
            PipelineConfig::from_toml_str("[consumer\n"),
            Err(ConfigError::Parse(_))
        ));
    }
}
