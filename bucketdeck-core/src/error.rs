//! Error types for bucketdeck

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SessionState;

#[derive(Error, Debug)]
pub enum DeckError {
    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Access to bucket '{0}' denied")]
    Forbidden(String),

    #[error("Object store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid part {part_number}: {reason}")]
    InvalidPart { part_number: u32, reason: String },

    #[error("Part {part_number} already recorded with a different completion token")]
    PartConflict { part_number: u32 },

    #[error("Incomplete part set: expected {expected} parts, {present} recorded")]
    IncompletePartSet { expected: u32, present: usize },

    #[error("Transport for part {part_number} expired")]
    TransportExpired { part_number: u32 },

    #[error("Unknown upload session: {0}")]
    UnknownSession(String),

    #[error("Object not found: {key}")]
    ObjectNotFound { key: String },

    #[error("Upload session {session} is {state}")]
    InvalidState { session: String, state: SessionState },

    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Invalid bucket name: {0}")]
    InvalidBucketName(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upload cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable error identifiers carried over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    BucketNotFound,
    Forbidden,
    StoreUnavailable,
    InvalidPart,
    PartConflict,
    IncompletePartSet,
    TransportExpired,
    UnknownSession,
    NotFound,
    InvalidState,
    Unauthenticated,
    InvalidInput,
    Cancelled,
    Config,
    Internal,
}

impl ErrorCode {
    /// Transient failures that a part upload may retry with a fresh transport
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorCode::StoreUnavailable | ErrorCode::TransportExpired)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::BucketNotFound => "BucketNotFound",
            ErrorCode::Forbidden => "Forbidden",
            ErrorCode::StoreUnavailable => "StoreUnavailable",
            ErrorCode::InvalidPart => "InvalidPart",
            ErrorCode::PartConflict => "PartConflict",
            ErrorCode::IncompletePartSet => "IncompletePartSet",
            ErrorCode::TransportExpired => "TransportExpired",
            ErrorCode::UnknownSession => "UnknownSession",
            ErrorCode::NotFound => "NotFound",
            ErrorCode::InvalidState => "InvalidState",
            ErrorCode::Unauthenticated => "Unauthenticated",
            ErrorCode::InvalidInput => "InvalidInput",
            ErrorCode::Cancelled => "Cancelled",
            ErrorCode::Config => "Config",
            ErrorCode::Internal => "Internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeckError {
    /// Wire code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            DeckError::BucketNotFound(_) => ErrorCode::BucketNotFound,
            DeckError::Forbidden(_) => ErrorCode::Forbidden,
            DeckError::StoreUnavailable(_) => ErrorCode::StoreUnavailable,
            DeckError::InvalidPart { .. } => ErrorCode::InvalidPart,
            DeckError::PartConflict { .. } => ErrorCode::PartConflict,
            DeckError::IncompletePartSet { .. } => ErrorCode::IncompletePartSet,
            DeckError::TransportExpired { .. } => ErrorCode::TransportExpired,
            DeckError::UnknownSession(_) => ErrorCode::UnknownSession,
            DeckError::ObjectNotFound { .. } => ErrorCode::NotFound,
            DeckError::InvalidState { .. } => ErrorCode::InvalidState,
            DeckError::Unauthenticated(_) => ErrorCode::Unauthenticated,
            DeckError::InvalidBucketName(_)
            | DeckError::InvalidKey(_)
            | DeckError::InvalidInput(_)
            | DeckError::Serialization(_) => ErrorCode::InvalidInput,
            DeckError::Cancelled => ErrorCode::Cancelled,
            DeckError::Config(_) => ErrorCode::Config,
            DeckError::Io(_) | DeckError::Internal(_) => ErrorCode::Internal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.code().is_retryable()
    }
}
