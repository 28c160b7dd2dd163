//! Core data models and types for bucketdeck

pub mod auth;
pub mod chunking;
pub mod config;
pub mod error;
pub mod types;

pub use auth::{authorize, Principal, SessionVerifier};
pub use chunking::*;
pub use config::*;
pub use error::*;
pub use types::*;

/// Result type alias for bucketdeck operations
pub type Result<T> = std::result::Result<T, DeckError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_id_creation() {
        let bucket = BucketId::new("test-bucket").unwrap();
        assert_eq!(bucket.as_str(), "test-bucket");
    }

    #[test]
    fn test_bucket_id_validation() {
        // Valid bucket ids
        assert!(BucketId::new("bucket").is_ok());
        assert!(BucketId::new("bucket-123").is_ok());
        assert!(BucketId::new("bucket_123").is_ok());
        assert!(BucketId::new("media.eu").is_ok());

        // Invalid bucket ids
        assert!(BucketId::new("").is_err());
        assert!(BucketId::new("bucket with spaces").is_err());
        assert!(BucketId::new("bucket/with/slashes").is_err());
    }

    #[test]
    fn test_key_validation() {
        assert!(Key::new("folder/file.txt").is_ok());
        assert!(Key::new("").is_err());
        assert!(Key::new("bad\nkey").is_err());
    }

    #[test]
    fn test_error_codes() {
        assert!(DeckError::StoreUnavailable("timeout".into()).is_retryable());
        assert!(DeckError::TransportExpired { part_number: 2 }.is_retryable());
        assert!(!DeckError::Forbidden("media".into()).is_retryable());
        assert!(!DeckError::PartConflict { part_number: 1 }.is_retryable());
        assert_eq!(
            DeckError::ObjectNotFound { key: "k".into() }.code(),
            ErrorCode::NotFound
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::IncompletePartSet).unwrap(),
            "\"IncompletePartSet\""
        );
    }
}
