use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::metric::FailureReason;

/// Errors that make a run impossible to start.
///
/// These are the only fatal errors in barrage: they are surfaced before any
/// traffic is generated. Everything that goes wrong while the run is in
/// progress is absorbed into the metrics instead.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("secret signing key is missing or empty")]
    MissingSecretKey,

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid threshold `{expression}`: {reason}")]
    InvalidThreshold { expression: String, reason: String },

    #[error("threshold references unknown metric `{0}`")]
    UnknownMetric(String),

    #[error("invalid duration `{0}` (expected a number followed by ms, s, m or h)")]
    InvalidDuration(String),

    #[error("invalid target url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("test data file {0} contains no records")]
    EmptyTestData(PathBuf),

    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to read test data: {0}")]
    Csv(#[from] csv::Error),

    #[error("failed to build http client: {0}")]
    Client(#[source] reqwest::Error),
}

/// Errors raised by the outbound call of a single iteration.
///
/// Never fatal: a worker converts these into a failing sample.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to read response body: {0}")]
    Body(String),
}

impl TransportError {
    /// The failure reason recorded in the iteration's sample.
    pub fn reason(&self) -> FailureReason {
        match self {
            Self::Timeout(_) => FailureReason::Timeout,
            Self::Connect(_) | Self::Request(_) | Self::Body(_) => FailureReason::Transport,
        }
    }
}

/// Errors emitted while writing the run summary.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),
}
