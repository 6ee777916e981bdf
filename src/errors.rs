//! Error types shared by the engine components.

use thiserror::Error;

use crate::models::JobStatus;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A status change that is not in the lifecycle transition table.
    #[error("invalid transition for job {job}: {from} -> {to}")]
    InvalidTransition {
        job: String,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("dependency cycle detected in workflow graph: {0}")]
    DependencyCycle(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// The graph store could not be reached. Callers retry these.
    #[error("graph store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("graph store error: {0}")]
    Store(String),

    /// The batch scheduler rejected or failed to accept a submission.
    #[error("submission failed: {0}")]
    Submission(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),

    #[error("job {job} is missing user data: {}", .names.join(", "))]
    MissingUserData { job: String, names: Vec<String> },

    #[error("invalid workflow specification: {0}")]
    InvalidSpec(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    /// Returns true for failures that are worth retrying after a backoff.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, EngineError::StoreUnavailable(_))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Scheduler(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
