//! Upload session model
//!
//! A session is one logical resumable upload: its identity, declared length,
//! confirmed offset, buffered tail and the multipart state backing it.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

pub mod assembler;
pub mod controller;
pub mod ledger;

pub use controller::{SessionController, SessionEvent};
pub use ledger::{Ledger, LedgerError, MemoryLedger};

use crate::storage::StorageError;

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Uploading,
    Completed,
    Aborted,
}

impl SessionState {
    /// Terminal states accept no further mutation
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Aborted)
    }
}

/// Opaque token for an in-progress multipart assembly on the storage backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartHandle {
    pub namespace: String,
    pub key: String,
    pub upload_id: String,
}

/// A part confirmed by the storage backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: u32,
    pub etag: String,
}

/// One resumable upload session
#[derive(Debug, Clone)]
pub struct Session {
    /// Opaque unique identifier, immutable after creation
    pub id: String,
    /// Storage namespace (bucket) the upload lands in, opaque to the core
    pub namespace: String,
    /// Declared total length; `None` means deferred (unknown at creation)
    pub total_length: Option<u64>,
    /// Bytes durably accepted so far (stored parts plus buffered tail)
    pub offset: u64,
    /// Client-supplied metadata, set once at creation
    pub metadata: HashMap<String, String>,
    /// Multipart state, created lazily on first append
    pub multipart: Option<MultipartHandle>,
    /// Confirmed parts in ascending part-number order, append-only
    pub parts: Vec<CompletedPart>,
    /// Buffered bytes below the part-size threshold
    pub pending_tail: Bytes,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Part numbers start at 1 and increase strictly per session
    pub fn next_part_number(&self) -> u32 {
        self.parts.len() as u32 + 1
    }

    /// Bytes still expected before the upload is complete, if the length is known
    pub fn remaining(&self) -> Option<u64> {
        self.total_length.map(|total| total.saturating_sub(self.offset))
    }
}

/// Errors surfaced by session operations
#[derive(Error, Debug)]
pub enum UploadError {
    #[error("upload not found: {0}")]
    NotFound(String),

    #[error("upload already exists: {0}")]
    AlreadyExists(String),

    #[error("offset mismatch: request declared {expected}, session is at {current}")]
    OffsetMismatch { expected: u64, current: u64 },

    #[error("invalid upload length")]
    InvalidLength,

    #[error("upload length already set")]
    LengthAlreadySet,

    #[error("upload incomplete: offset {offset} of {total}")]
    IncompleteUpload { offset: u64, total: u64 },

    #[error("chunk would exceed declared upload length")]
    PayloadTooLarge,

    #[error("conflicting session state: {0}")]
    Conflict(String),

    #[error("storage write failed after {attempts} attempts: {source}")]
    StorageWriteFailed { attempts: u32, source: StorageError },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<LedgerError> for UploadError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(id) => UploadError::NotFound(id),
            LedgerError::AlreadyExists(id) => UploadError::AlreadyExists(id),
            LedgerError::Conflict(reason) => UploadError::Conflict(reason),
            LedgerError::IncompleteUpload { offset, total } => {
                UploadError::IncompleteUpload { offset, total }
            }
        }
    }
}
