use thiserror::Error;

use crate::store::StoreError;

/// Failure while provisioning a job. The message is stored on the job row
/// as `lasterror` and the job is cancelled; nothing retries automatically.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// Missing collaborator, bad username, bad directory pattern, missing
    /// jail helper. Needs an operator.
    #[error("{0}")]
    Config(String),
    /// Filesystem, checkout, or process-launch failure.
    #[error("{0}")]
    Environment(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl RunnerError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn env(message: impl Into<String>) -> Self {
        Self::Environment(message.into())
    }
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("evaluation failed: {0}")]
    Evaluation(#[source] anyhow::Error),
    #[error("unknown runner {0:?}")]
    UnknownRunner(String),
    #[error("invalid tag {0:?}")]
    InvalidTag(String),
    #[error("unknown pset {0}")]
    UnknownPset(i64),
    #[error("no such job {0}")]
    UnknownJob(i64),
}
