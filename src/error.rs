use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Glob(#[from] globset::Error),
    #[error(transparent)]
    Walk(#[from] ignore::Error),

    /// A malformed descriptor or tool field, caught before dispatch.
    #[error("validation error: {0}")]
    Validation(String),

    /// A container was required by the tool but disabled by the runtime.
    #[error("unsupported requirement: {0}")]
    UnsupportedRequirement(String),

    /// A failure while running or collecting a job, reported as permanentFail.
    #[error("{0}")]
    Workflow(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn workflow(msg: impl Into<String>) -> Self {
        Self::Workflow(msg.into())
    }

    /// Errors that classify the job as permanentFail rather than aborting the
    /// runner itself.
    pub fn is_job_failure(&self) -> bool {
        matches!(self, Self::Workflow(_) | Self::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
