//! bucketdeck client SDK
//!
//! HTTP client for the bucketdeck API plus the caller side of the upload
//! pipeline: chunk sources, the bounded part scheduler and whole-object
//! upload orchestration.

pub mod backend;
pub mod client;
pub mod error;
pub mod multipart;
pub mod scheduler;
pub mod streaming;

pub use backend::{transfer_part, OpenedUpload, UploadBackend};
pub use client::{ClientTimeouts, DeckClient};
pub use error::ClientError;
pub use multipart::{UploadOptions, UploadReport, Uploader};
pub use scheduler::{retry_delay, AbortGuard, CancellationHandle, ChunkScheduler, Progress, ProgressFn};
pub use streaming::{BytesSource, ChunkSource, FileSource};

pub type Result<T> = std::result::Result<T, ClientError>;
