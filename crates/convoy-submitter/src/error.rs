use convoy_core::model::JobName;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SubmitterError {
    #[error(transparent)]
    Coordination(#[from] convoy_core::errors::CoordinationError),

    #[error("External scheduler rejected submission of '{script}': {stderr}")]
    SubmissionFailed { script: PathBuf, stderr: String },

    #[error("External scheduler query failed: {0}")]
    SchedulerQuery(String),

    #[error("Execution of job '{0}' failed: {1}")]
    Execution(JobName, String),
}

pub type Result<T> = std::result::Result<T, SubmitterError>;
