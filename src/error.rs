//! Error types for the MedGemma worker.
//!
//! Every variant displays as its bare message: the job result sent back to the
//! queue carries exactly that text and nothing else.

use std::result;
use thiserror::Error;

/// A specialized Result type for worker operations.
pub type Result<T> = result::Result<T, Error>;

/// The error type for worker operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing credential, missing job source, unreadable configuration
    #[error("{0}")]
    ConfigurationError(String),

    /// Rejected job input
    #[error("{0}")]
    ValidationError(String),

    /// Model or tokenizer could not be loaded by the provider
    #[error(transparent)]
    ProviderError(anyhow::Error),

    /// Tokenization, generation or decoding failed
    #[error(transparent)]
    GenerationError(anyhow::Error),

    /// Job queue transport failures
    #[error("{0}")]
    RuntimeError(String),
}

impl Error {
    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ProviderError(_) | Error::GenerationError(_) | Error::RuntimeError(_)
        )
    }

    /// Short name of the error kind, used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ConfigurationError(_) => "configuration",
            Error::ValidationError(_) => "validation",
            Error::ProviderError(_) => "provider",
            Error::GenerationError(_) => "generation",
            Error::RuntimeError(_) => "runtime",
        }
    }
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::ConfigurationError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ValidationError(err.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::RuntimeError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::RuntimeError(err.to_string())
    }
}
