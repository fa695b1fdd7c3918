use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a single probe failed. Probe failures are recorded as lost samples,
/// never propagated as errors out of the probe loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum ProbeFailure {
    #[error("request timed out")]
    Timeout,
    #[error("could not resolve host: {0}")]
    Resolution(String),
    #[error("{0}")]
    Other(String),
}

impl ProbeFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeFailure::Timeout)
    }
}

/// A throughput test that did not complete. Ends that run only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ThroughputFailure {
    pub message: String,
}

impl ThroughputFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ThroughputFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Synchronous, non-fatal refusal of a front-end command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandRejected {
    #[error("speed test already running")]
    ThroughputAlreadyRunning,
}
