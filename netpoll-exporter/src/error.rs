//! Application-wide error types.

use std::time::Duration;

use thiserror::Error;

use crate::client::ApiError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Upstream error: {0}")]
    Api(#[from] ApiError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Panicked: {0}")]
    Panicked(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Metric already registered: {0}")]
    MetricExists(String),

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Task group error: {0}")]
    TaskGroup(#[from] task_group::TaskGroupError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Stable type name used as the `error_type` label and in skip reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Api(e) => e.kind(),
            Error::Timeout(_) => "TimeoutError",
            Error::Panicked(_) => "Panic",
            Error::Metrics(_) => "MetricsError",
            Error::MetricExists(_) => "MetricExists",
            Error::UnknownMetric(_) => "UnknownMetric",
            Error::Configuration(_) => "ConfigurationError",
            Error::TaskGroup(_) => "TaskGroupError",
            Error::Io(_) => "IoError",
            Error::Other(_) => "Other",
        }
    }
}
