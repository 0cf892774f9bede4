//! Error type shared by all log engine operations.

use std::io;

/// Errors surfaced by the log engine.
///
/// Device failures are fatal for the whole engine: once an I/O error is
/// observed, metadata consistency on the shared device can no longer be
/// assured and the process should shut down. Everything else is scoped to
/// the operation (or, for load failures, to the affected log).
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The version supplied to an append or advance does not move the log
    /// forward. The log is left unchanged.
    #[error("version {ver} does not advance current version {current}")]
    VersionRegression {
        /// Version the caller supplied.
        ver: i64,
        /// Latest version already recorded by the log.
        current: i64,
    },

    /// The log's entry address space is exhausted; the caller must trim
    /// before appending more.
    #[error("log is full")]
    LogFull,

    /// No entry matches the requested version, clock, or index.
    #[error("entry not found")]
    NotFound,

    /// The log's metadata could not be loaded or created.
    #[error("metadata load failed: {0}")]
    MetadataLoadFailed(String),

    /// A device read or write failed.
    #[error("device i/o error: {0}")]
    DeviceIo(#[from] io::Error),

    /// Lock construction failed while building a log facade.
    #[error("failed to initialize log locks")]
    LockInit,

    /// A caller-supplied argument is out of range or malformed.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// On-device or wire bytes failed validation.
    #[error("corruption detected: {0}")]
    Corruption(String),
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, LogError>;
