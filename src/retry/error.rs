use crate::{retry, ProcessorError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("Retry interrupted by shutdown signal")]
    Interrupted,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<retry::RetryError> for ProcessorError {
    fn from(err: retry::RetryError) -> Self {
        match err {
            retry::RetryError::Interrupted => ProcessorError::Shutdown,
            retry::RetryError::Other(e) => ProcessorError::Other(e),
        }
    }
}

impl RetryError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RetryError::Interrupted)
    }
}
