//! Error kinds surfaced by the file system core.

use std::io;
use thiserror::Error;

/// The six error kinds the core can raise.
///
/// Short transfers (a read or write that moves fewer bytes than requested)
/// are not modeled as errors: they come back as `Ok(n)` with `n` smaller
/// than asked for.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("free map exhausted")]
    NoSpace,

    #[error("allocation failed")]
    NoMemory,

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("device I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("permission denied: {0}")]
    PermissionDenied(String),
}

pub type FsResult<T> = Result<T, FsError>;
