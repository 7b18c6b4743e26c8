//! Error types for marfs

use thiserror::Error;

/// Errors raised by the archive, the overlay engine and the mount adapter
#[derive(Error, Debug)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Read-only: {0}")]
    ReadOnly(String),

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Is a directory: {0}")]
    IsADirectory(String),

    #[error("Directory not empty: {0}")]
    NotEmpty(String),

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid file handle: {0}")]
    InvalidHandle(u64),

    #[error("Archive build failed: {0}")]
    BuildFailure(String),

    #[error("Corrupt archive: {0}")]
    Corrupt(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// POSIX errno reported to the host for this error
    pub fn errno(&self) -> i32 {
        match self {
            Error::NotFound(_) => libc::ENOENT,
            Error::AlreadyExists(_) => libc::EEXIST,
            Error::Unsupported(_) => libc::ENOTSUP,
            Error::ReadOnly(_) => libc::EROFS,
            Error::NotADirectory(_) => libc::ENOTDIR,
            Error::IsADirectory(_) => libc::EISDIR,
            Error::NotEmpty(_) => libc::ENOTEMPTY,
            Error::InvalidPath(_) => libc::EINVAL,
            Error::InvalidHandle(_) => libc::EBADF,
            Error::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Error::BuildFailure(_)
            | Error::Corrupt(_)
            | Error::Config(_)
            | Error::InvalidConfig(_)
            | Error::Internal(_) => libc::EIO,
        }
    }

    /// Whether this is an expected condition the caller can recover from
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_)
                | Error::AlreadyExists(_)
                | Error::Unsupported(_)
                | Error::ReadOnly(_)
                | Error::NotADirectory(_)
                | Error::IsADirectory(_)
                | Error::NotEmpty(_)
                | Error::InvalidPath(_)
        )
    }
}

/// Result type for marfs operations
pub type Result<T> = std::result::Result<T, Error>;
