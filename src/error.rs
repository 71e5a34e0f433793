//! Error handling and custom error types
//!
//! Provides unified error handling across the service using thiserror, plus
//! the stable error taxonomy reported to batch callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Where a size limit was tripped while fetching a remote resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizePhase {
    /// The server's claimed `Content-Length` on the HEAD request.
    Claimed,
    /// The running byte count while streaming the body.
    Streamed,
}

impl fmt::Display for SizePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SizePhase::Claimed => write!(f, "claimed"),
            SizePhase::Streamed => write!(f, "streamed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Image decoding error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("Payload too large ({phase} size exceeds {limit} bytes)")]
    TooLarge { phase: SizePhase, limit: u64 },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Render failed: {0}")]
    RenderFailed(String),

    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    #[error("Blob store error: {0}")]
    StoreFailed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Stable error kinds surfaced in batch results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    UnsupportedType,
    TooLarge,
    Timeout,
    RenderFailed,
    FetchFailed,
    StoreFailed,
    Internal,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "INVALID_INPUT",
            ErrorKind::UnsupportedType => "UNSUPPORTED_TYPE",
            ErrorKind::TooLarge => "TOO_LARGE",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::RenderFailed => "RENDER_FAILED",
            ErrorKind::FetchFailed => "FETCH_FAILED",
            ErrorKind::StoreFailed => "STORE_FAILED",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Client-caused kinds map to `ClientError`; everything else is on us.
    pub fn status_class(self) -> crate::batch::StatusClass {
        use crate::batch::StatusClass;

        match self {
            ErrorKind::InvalidInput | ErrorKind::UnsupportedType | ErrorKind::TooLarge => {
                StatusClass::ClientError
            }
            _ => StatusClass::ServerError,
        }
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidInput(_) => ErrorKind::InvalidInput,
            Error::UnsupportedType(_) => ErrorKind::UnsupportedType,
            Error::TooLarge { .. } => ErrorKind::TooLarge,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::RenderFailed(_) => ErrorKind::RenderFailed,
            Error::FetchFailed(_) | Error::Http(_) => ErrorKind::FetchFailed,
            Error::StoreFailed(_) => ErrorKind::StoreFailed,
            Error::Io(_)
            | Error::Serialization(_)
            | Error::Image(_)
            | Error::Config(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }
}
