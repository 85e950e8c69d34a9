use std::io;
use std::time::Duration;

use thiserror::Error;
use validator::ValidationErrors;

pub type VirtualFileResult<T> = Result<T, VirtualFileError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VirtualFileError {
    #[error("Invalid config: {description}")]
    ConfigInvalid { description: String },
    #[error("Virtual file is already opened")]
    AlreadyOpen,
    #[error("Virtual file must be opened first")]
    NotOpen,
    #[error("Offset {offset} is out of range, resource size is {size}")]
    OutOfRange { offset: u64, size: u64 },
    #[error("Transport error: {description}")]
    Transport { description: String },
    #[error("Resource metadata is missing: {header}")]
    MetadataMissing { header: String },
    #[error("Pool is closed")]
    PoolClosed,
    #[error("Block {index} is not ready after {waited:?}")]
    Timeout { index: u64, waited: Duration },
    #[error("Service internal error: {description}")]
    ServiceError { description: String },
}

impl VirtualFileError {
    pub fn config_invalid(description: impl Into<String>) -> Self {
        VirtualFileError::ConfigInvalid {
            description: description.into(),
        }
    }

    pub fn transport(description: impl Into<String>) -> Self {
        VirtualFileError::Transport {
            description: description.into(),
        }
    }

    pub fn service_error(description: impl Into<String>) -> Self {
        VirtualFileError::ServiceError {
            description: description.into(),
        }
    }

    pub fn metadata_missing(header: impl Into<String>) -> Self {
        VirtualFileError::MetadataMissing {
            header: header.into(),
        }
    }
}

impl From<reqwest::Error> for VirtualFileError {
    fn from(err: reqwest::Error) -> Self {
        VirtualFileError::transport(err.to_string())
    }
}

impl From<io::Error> for VirtualFileError {
    fn from(err: io::Error) -> Self {
        VirtualFileError::transport(err.to_string())
    }
}

impl From<ValidationErrors> for VirtualFileError {
    fn from(err: ValidationErrors) -> Self {
        VirtualFileError::config_invalid(err.to_string())
    }
}
