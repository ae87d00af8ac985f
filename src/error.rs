//! Crate-wide error type.

use std::io;
use thiserror::Error;

/// Convenience alias used by every fallible operation in this crate.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors produced by the quad store and its collaborators.
#[derive(Debug, Error)]
pub enum StoreError {
    /// An underlying read or write failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The store was opened with invalid or incompatible parameters.
    #[error("configuration error: {0}")]
    Config(String),
    /// On-disk data failed an integrity check.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Another process holds the data directory.
    #[error("data directory is locked: {0}")]
    Locked(String),
    /// A caller-supplied value is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The requested entity does not exist.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The operation is not supported by this implementation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}
