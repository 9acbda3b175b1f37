use crate::types::JobId;
use std::result;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} is not running")]
    NotRunning(JobId),
    #[error("job {0} is already running")]
    AlreadyRunning(JobId),
}

pub type Result<T> = result::Result<T, JobError>;
