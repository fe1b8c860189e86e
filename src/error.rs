use thiserror::Error;

/// Outcome of a partition / secure storage access, mirrors the AVB I/O results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum IoError {
    #[error("I/O error")]
    Io,
    #[error("out of memory")]
    Oom,
    #[error("no such partition")]
    NoSuchPartition,
    #[error("range outside partition")]
    RangeOutsidePartition,
}

pub type IoResult<T> = Result<T, IoError>;

/// Fatal results of the A/B selection flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AbFlowError {
    #[error("ERROR_OOM")]
    Oom,
    #[error("ERROR_IO")]
    Io,
    #[error("ERROR_NO_BOOTABLE_SLOTS")]
    NoBootableSlots,
    #[error("ERROR_INVALID_ARGUMENT")]
    InvalidArgument,
}

impl From<IoError> for AbFlowError {
    fn from(err: IoError) -> Self {
        match err {
            IoError::Oom => AbFlowError::Oom,
            _ => AbFlowError::Io,
        }
    }
}
