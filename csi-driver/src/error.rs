//! Driver error taxonomy
//!
//! Every fallible driver operation returns [`DriverError`]. The conversion to
//! `tonic::Status` below is the single place where error kinds turn into
//! gRPC codes.

use storage_api::ApiError;
use thiserror::Error;
use tonic::Status;

use crate::locks::LockError;
use crate::platform::PlatformError;
use crate::types::ParamError;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    AlreadyExists(String),

    #[error("{0}")]
    FailedPrecondition(String),

    #[error("{0}")]
    OutOfRange(String),

    #[error("{0}")]
    Aborted(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Internal(String),

    #[error("{0}")]
    Unimplemented(String),

    #[error("storage backend: {0}")]
    Backend(#[from] ApiError),

    #[error("host operation failed: {0}")]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl DriverError {
    /// Short code name, used as the metrics status label.
    pub fn code_name(&self) -> &'static str {
        match self {
            DriverError::InvalidArgument(_) => "invalid_argument",
            DriverError::NotFound(_) => "not_found",
            DriverError::AlreadyExists(_) => "already_exists",
            DriverError::FailedPrecondition(_) => "failed_precondition",
            DriverError::OutOfRange(_) => "out_of_range",
            DriverError::Aborted(_) => "aborted",
            DriverError::Unavailable(_) | DriverError::Lock(_) => "unavailable",
            DriverError::Unimplemented(_) => "unimplemented",
            DriverError::Internal(_) | DriverError::Backend(_) | DriverError::Platform(_) => {
                "internal"
            }
        }
    }
}

impl From<ParamError> for DriverError {
    fn from(e: ParamError) -> Self {
        DriverError::InvalidArgument(e.to_string())
    }
}

impl From<DriverError> for Status {
    fn from(e: DriverError) -> Self {
        let message = e.to_string();
        match e {
            DriverError::InvalidArgument(_) => Status::invalid_argument(message),
            DriverError::NotFound(_) => Status::not_found(message),
            DriverError::AlreadyExists(_) => Status::already_exists(message),
            DriverError::FailedPrecondition(_) => Status::failed_precondition(message),
            DriverError::OutOfRange(_) => Status::out_of_range(message),
            DriverError::Aborted(_) => Status::aborted(message),
            DriverError::Unavailable(_) | DriverError::Lock(_) => Status::unavailable(message),
            DriverError::Unimplemented(_) => Status::unimplemented(message),
            DriverError::Internal(_) | DriverError::Backend(_) | DriverError::Platform(_) => {
                Status::internal(message)
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
