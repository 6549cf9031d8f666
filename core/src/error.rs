//! Error types for the harness client.
//!
//! # Design
//! Errors are split by the stage that failed: `EncodingError` while turning a
//! payload into body bytes, `TransportError` while resolving a scheme or
//! performing the round trip. `Error` wraps both so `Session::call` and
//! `Registry::dispatch` have a single error type while callers can still tell
//! the stages apart. Nothing here is retried.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failure while encoding a request payload.
#[derive(Debug, Error)]
pub enum EncodingError {
    #[error("file not found: {}", path.display())]
    FileNotFound { path: PathBuf },

    #[error("permission denied reading {}", path.display())]
    PermissionDenied { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A header name or value would break request framing.
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },
}

impl EncodingError {
    /// Classify an I/O failure on `path`.
    pub(crate) fn from_io(path: PathBuf, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => EncodingError::FileNotFound { path },
            io::ErrorKind::PermissionDenied => EncodingError::PermissionDenied { path },
            _ => EncodingError::Io { path, source: err },
        }
    }
}

/// Failure while resolving or performing a transport round trip.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("no transport registered for scheme {scheme:?}")]
    SchemeNotRegistered { scheme: String },

    #[error("connection to {addr} failed: {source}")]
    ConnectionFailed {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The deadline expired; whatever was read so far is discarded.
    #[error("connection to {addr} timed out")]
    Timeout { addr: String },

    #[error("malformed response: {0}")]
    MalformedResponse(String),

    /// The virtual transport has no resource at this path.
    #[error("not found: {path}")]
    NotFound { path: String },

    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

/// Error returned by `Registry::dispatch` and `Session::call`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("encode: {0}")]
    Encode(#[from] EncodingError),

    #[error("dispatch: {0}")]
    Dispatch(#[from] TransportError),
}
