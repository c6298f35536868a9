use std::time::Duration;

use cache::{CacheError, ContentId};
use thiserror::Error;

pub type Result<T, E = FetchError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Wrong input: {description}")]
    BadInput { description: String },
    #[error("No fetch request for {id}")]
    NotFound { id: ContentId },
    #[error("Fetch service error: {description}")]
    ServiceError { description: String },
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl FetchError {
    pub fn bad_input(description: impl Into<String>) -> Self {
        FetchError::BadInput {
            description: description.into(),
        }
    }

    pub fn service_error(description: impl Into<String>) -> Self {
        FetchError::ServiceError {
            description: description.into(),
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::service_error(format!("IO Error: {err}"))
    }
}

/// The fetched bytes couldn't be turned into an image.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated image data: {0}")]
    Truncated(String),
    #[error("Malformed image data: {0}")]
    Malformed(String),
    #[error("Decoder is shut down")]
    Cancelled,
}

/// Failure of a single HTTP exchange.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// The server answered with an error status.
    #[error("HTTP status {status}")]
    Status {
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("Request timed out")]
    Timeout,
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Transport is shut down")]
    Cancelled,
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Worth trying again later: server overload, throttling, or a network hiccup.
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Status { status, .. } => *status >= 500 || *status == 429,
            TransportError::Timeout | TransportError::Connection(_) => true,
            TransportError::Cancelled => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TransportError::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else if let Some(status) = err.status() {
            TransportError::Status {
                status: status.as_u16(),
                retry_after: None,
            }
        } else {
            TransportError::Connection(err.to_string())
        }
    }
}
