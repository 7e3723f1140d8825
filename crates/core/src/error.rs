//! Unified error types for pixstash.
//!
//! Below the fetch-task boundary every one of these is logged and absorbed;
//! callers only ever observe "no image produced".

use tokio_rusqlite::rusqlite;

/// Unified error type for cache, codec and transport failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid input parameters (e.g., empty key).
    #[error("INVALID_INPUT: {0}")]
    InvalidInput(String),

    /// Store operation failed.
    #[error("STORE_ERROR: {0}")]
    Database(tokio_rusqlite::Error),

    /// Migration failed to apply.
    #[error("STORE_ERROR: migration failed: {0}")]
    MigrationFailed(String),

    /// The store was closed while an operation was using it.
    #[error("STORE_CLOSED")]
    StoreClosed,

    /// Filesystem failure around the store directory or editor buffers.
    #[error("IO_ERROR: {0}")]
    Io(#[from] std::io::Error),

    /// Not enough free space on the volume for the configured budget.
    #[error("INSUFFICIENT_SPACE: {available} bytes available, {required} required")]
    InsufficientSpace { available: u64, required: u64 },

    /// Entry larger than the whole store budget.
    #[error("ENTRY_TOO_LARGE: {size} bytes exceeds the {budget} byte store budget")]
    EntryTooLarge { size: u64, budget: u64 },

    /// Image bytes could not be decoded or encoded.
    #[error("CODEC_ERROR: {0}")]
    Codec(String),

    /// Invalid URL.
    #[error("INVALID_URL: {0}")]
    InvalidUrl(String),

    /// Network failure while opening or reading a response.
    #[error("TRANSPORT_ERROR: {0}")]
    Transport(String),

    /// Non-success HTTP status.
    #[error("HTTP_ERROR: status {0}")]
    HttpStatus(u16),

    /// Fetch response too large.
    #[error("FETCH_TOO_LARGE: {0}")]
    FetchTooLarge(String),
}

impl From<tokio_rusqlite::Error<Error>> for Error {
    fn from(err: tokio_rusqlite::Error<Error>) -> Self {
        match err {
            tokio_rusqlite::Error::Error(e) => e,
            tokio_rusqlite::Error::ConnectionClosed => Error::StoreClosed,
            tokio_rusqlite::Error::Close(c) => Error::Database(tokio_rusqlite::Error::Close(c)),
            _ => Error::StoreClosed,
        }
    }
}

impl From<tokio_rusqlite::Error<rusqlite::Error>> for Error {
    fn from(err: tokio_rusqlite::Error<rusqlite::Error>) -> Self {
        match err {
            tokio_rusqlite::Error::ConnectionClosed => Error::StoreClosed,
            other => Error::Database(other),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Database(tokio_rusqlite::Error::Error(err))
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<png::DecodingError> for Error {
    fn from(err: png::DecodingError) -> Self {
        Error::Codec(err.to_string())
    }
}
