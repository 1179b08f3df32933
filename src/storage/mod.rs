//! Storage backend abstraction
//!
//! Multipart object-storage contract: begin, upload-part, complete, abort.
//! `complete_multipart` is the atomic commit point; until it succeeds the
//! object does not exist as a readable whole.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::session::{CompletedPart, MultipartHandle};

pub mod memory;
pub mod s3;

pub use memory::MemoryBackend;
pub use s3::S3Backend;

/// Storage backend errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Transport-level or throttling failure, worth retrying
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Part numbers non-contiguous or a part tag does not match the backend's record
    #[error("incomplete part set: {0}")]
    IncompletePartSet(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the caller should retry with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

/// The committed object, returned by a successful completion
#[derive(Debug, Clone)]
pub struct ObjectDescriptor {
    pub namespace: String,
    pub key: String,
    pub etag: String,
}

/// Multipart object-storage API
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Start a multipart assembly for `key` in `namespace`
    async fn begin_multipart(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<MultipartHandle, StorageError>;

    /// Upload one part; returns the backend's tag for it.
    ///
    /// Part numbers are assigned monotonically by the caller; re-uploading
    /// the same number replaces the earlier attempt, which makes retries safe.
    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError>;

    /// Atomically commit the object from the ordered part list
    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor, StorageError>;

    /// Release uploaded-but-uncommitted parts; idempotent
    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<(), StorageError>;
}
