//! Error types for cowsnap
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//! Every error maps to an errno-style [`ErrorCode`] for the control surface.

use crate::types::Tid;
use std::io;
use thiserror::Error;

/// Result type alias for cowsnap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the snapshot engine
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error reading or writing the block device
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Direct modification of protected snapshot state
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Invalid argument or operation in the current state
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Target file is expected to be empty
    #[error("Not empty: {0}")]
    NotEmpty(String),

    /// Target already carries snapshot state
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Out of free blocks
    #[error("No space: {0}")]
    NoSpace(String),

    /// Transaction handle lacks the credits for the requested change
    #[error("Insufficient transaction credits: needed {needed}, available {available}")]
    InsufficientCredits {
        /// Credits required
        needed: u32,
        /// Credits left on the handle
        available: u32,
    },

    /// Transaction was aborted after a fatal error
    #[error("Transaction {0} aborted")]
    TransactionAborted(Tid),

    /// Inode or record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl Error {
    /// Build a `PermissionDenied` error
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Error::PermissionDenied(msg.into())
    }

    /// Build an `InvalidArgument` error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Build an `IoError` of kind `Other`
    pub fn io(msg: impl Into<String>) -> Self {
        Error::IoError(io::Error::new(io::ErrorKind::Other, msg.into()))
    }

    /// Build a `NotFound` error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Error::NotFound(msg.into())
    }

    /// Control-surface code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::IoError(_)
            | Error::TransactionAborted(_)
            | Error::Corruption(_)
            | Error::SerializationError(_) => ErrorCode::Io,
            Error::PermissionDenied(_) => ErrorCode::PermissionDenied,
            Error::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Error::NotEmpty(_) => ErrorCode::NotEmpty,
            Error::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Error::NoSpace(_) | Error::InsufficientCredits { .. } => ErrorCode::NoSpace,
            Error::NotFound(_) => ErrorCode::NotFound,
        }
    }

    /// True for errors that must abort the enclosing transaction
    pub fn is_fatal(&self) -> bool {
        self.code() == ErrorCode::Io
    }
}

/// Codes surfaced to the control layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// EPERM
    PermissionDenied,
    /// ENOENT
    NotFound,
    /// EIO
    Io,
    /// EEXIST
    AlreadyExists,
    /// EINVAL
    InvalidArgument,
    /// ENOSPC
    NoSpace,
    /// ENOTEMPTY
    NotEmpty,
}

impl ErrorCode {
    /// Linux errno value
    pub fn errno(self) -> i32 {
        match self {
            ErrorCode::PermissionDenied => 1,
            ErrorCode::NotFound => 2,
            ErrorCode::Io => 5,
            ErrorCode::AlreadyExists => 17,
            ErrorCode::InvalidArgument => 22,
            ErrorCode::NoSpace => 28,
            ErrorCode::NotEmpty => 39,
        }
    }
}
