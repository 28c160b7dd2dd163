//! Client error types

use bucketdeck_core::{DeckError, ErrorCode};
use bucketdeck_wire::{ErrorBody, WireError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Server returned {status} {code}: {message}")]
    Api {
        status: u16,
        code: ErrorCode,
        message: String,
    },

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Core error: {0}")]
    Core(#[from] DeckError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    /// Error response of the bucketdeck API
    pub fn api(status: u16, body: ErrorBody) -> Self {
        ClientError::Api {
            status,
            code: body.code,
            message: body.error,
        }
    }

    /// Taxonomy code of this error.
    ///
    /// Network failures and unstructured 5xx responses count as an
    /// unavailable store, since the part may go through on another attempt.
    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Connection(_) => ErrorCode::StoreUnavailable,
            ClientError::Api { code, .. } => *code,
            ClientError::Http { status, .. } => match status {
                401 => ErrorCode::Unauthenticated,
                403 => ErrorCode::Forbidden,
                404 => ErrorCode::NotFound,
                408 | 429 | 500..=599 => ErrorCode::StoreUnavailable,
                400..=499 => ErrorCode::InvalidInput,
                _ => ErrorCode::Internal,
            },
            ClientError::InvalidResponse(_) | ClientError::Io(_) => ErrorCode::Internal,
            ClientError::InvalidUrl(_) => ErrorCode::Config,
            ClientError::Core(err) => err.code(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        self.code() == ErrorCode::Cancelled
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return ClientError::InvalidResponse(err.to_string());
        }
        match err.status() {
            Some(status) => ClientError::Http {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => ClientError::Connection(err.to_string()),
        }
    }
}

impl From<WireError> for ClientError {
    fn from(err: WireError) -> Self {
        ClientError::Core(err.into())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::InvalidResponse(err.to_string())
    }
}
