use actix_web::{error, Error};
use virtual_file::VirtualFileError;

pub fn virtual_file_into_actix_error(err: VirtualFileError) -> Error {
    match err {
        VirtualFileError::OutOfRange { .. } => error::ErrorRangeNotSatisfiable(format!("{err}")),
        VirtualFileError::NotOpen | VirtualFileError::Timeout { .. } => {
            error::ErrorServiceUnavailable(format!("{err}"))
        }
        VirtualFileError::ConfigInvalid { .. }
        | VirtualFileError::AlreadyOpen
        | VirtualFileError::Transport { .. }
        | VirtualFileError::MetadataMissing { .. }
        | VirtualFileError::PoolClosed
        | VirtualFileError::ServiceError { .. } => {
            log::warn!("error processing request: {err}");
            error::ErrorInternalServerError(format!("{err}"))
        }
    }
}
