use crate::browse::BrowseError;
use joblib::error::JobError;
use joblib::StoreError;
use tonic::Status;

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Browse(#[from] BrowseError),
    #[error("rsync not available")]
    RsyncUnavailable,
    #[error("{0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        let message = err.to_string();
        match err {
            ServiceError::Job(JobError::NotFound(_)) | ServiceError::Store(StoreError::NotFound(_)) => {
                Status::not_found(message)
            }
            ServiceError::Job(JobError::NotRunning(_)) => Status::failed_precondition(message),
            ServiceError::Job(JobError::AlreadyRunning(_)) => Status::already_exists(message),
            ServiceError::Store(StoreError::Backend(_)) | ServiceError::Internal(_) => {
                tracing::error!(error = %message, "request failed");
                Status::internal(message)
            }
            ServiceError::Browse(BrowseError::OutsideRoot(_)) | ServiceError::InvalidArgument(_) => {
                Status::invalid_argument(message)
            }
            ServiceError::Browse(BrowseError::Io(_)) => Status::internal(message),
            ServiceError::RsyncUnavailable => Status::unavailable(message),
        }
    }
}
