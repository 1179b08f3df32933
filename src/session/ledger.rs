//! Offset ledger
//!
//! The single source of truth for how many bytes a session has durably
//! accepted. The ledger must never report an offset that is not backed by
//! storage-committed or buffer-committed bytes; clients resume by reading
//! the offset and continuing byte-exact from there.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use thiserror::Error;

use super::{CompletedPart, MultipartHandle, Session, SessionState};

/// Ledger errors
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("no ledger entry for upload: {0}")]
    NotFound(String),

    #[error("ledger entry already exists: {0}")]
    AlreadyExists(String),

    #[error("ledger conflict: {0}")]
    Conflict(String),

    #[error("upload incomplete: offset {offset} of {total}")]
    IncompleteUpload { offset: u64, total: u64 },
}

/// Atomic update applied to a session by a successful append
#[derive(Debug)]
pub struct Advance {
    /// Bytes newly accepted (stored or buffered)
    pub delta: u64,
    /// Parts confirmed by the storage backend during this append
    pub new_parts: Vec<CompletedPart>,
    /// Replacement pending tail
    pub pending_tail: Bytes,
}

/// Durable per-upload record store.
///
/// Every mutation is an atomic per-key read-modify-write; `advance` refuses
/// updates that would push the offset past the declared total or touch a
/// terminal session.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn create(
        &self,
        id: &str,
        namespace: &str,
        total_length: Option<u64>,
        metadata: HashMap<String, String>,
    ) -> Result<Session, LedgerError>;

    async fn get(&self, id: &str) -> Result<Session, LedgerError>;

    async fn advance(&self, id: &str, update: Advance) -> Result<Session, LedgerError>;

    /// Record the lazily-created multipart handle for a session
    async fn attach_multipart(
        &self,
        id: &str,
        handle: MultipartHandle,
    ) -> Result<Session, LedgerError>;

    /// Fix a deferred total length
    async fn set_total_length(&self, id: &str, total: u64) -> Result<Session, LedgerError>;

    /// Transition to `Completed`; fails unless `offset == total_length`
    async fn finalize(&self, id: &str) -> Result<Session, LedgerError>;

    /// Transition to `Aborted`; idempotent for already-aborted sessions
    async fn mark_aborted(&self, id: &str) -> Result<Session, LedgerError>;

    /// Drop the entry entirely; idempotent. Used by the expiry collaborator.
    async fn remove(&self, id: &str) -> Result<(), LedgerError>;
}

/// In-memory ledger backed by a concurrent map.
///
/// Each entry mutates under its own shard lock, which gives the atomic
/// per-key read-modify-write the contract requires.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    sessions: DashMap<String, Session>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn mutate<F>(&self, id: &str, f: F) -> Result<Session, LedgerError>
    where
        F: FnOnce(&mut Session) -> Result<(), LedgerError>,
    {
        let mut entry = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))?;
        f(entry.value_mut())?;
        Ok(entry.value().clone())
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn create(
        &self,
        id: &str,
        namespace: &str,
        total_length: Option<u64>,
        metadata: HashMap<String, String>,
    ) -> Result<Session, LedgerError> {
        let session = Session {
            id: id.to_string(),
            namespace: namespace.to_string(),
            total_length,
            offset: 0,
            metadata,
            multipart: None,
            parts: Vec::new(),
            pending_tail: Bytes::new(),
            state: SessionState::Created,
            created_at: Utc::now(),
        };

        match self.sessions.entry(id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(LedgerError::AlreadyExists(id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(session.clone());
                Ok(session)
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Session, LedgerError> {
        self.sessions
            .get(id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| LedgerError::NotFound(id.to_string()))
    }

    async fn advance(&self, id: &str, update: Advance) -> Result<Session, LedgerError> {
        self.mutate(id, |session| {
            if session.state.is_terminal() {
                return Err(LedgerError::Conflict(format!(
                    "upload {} is {:?}",
                    session.id, session.state
                )));
            }
            let new_offset = session.offset + update.delta;
            if let Some(total) = session.total_length {
                if new_offset > total {
                    return Err(LedgerError::Conflict(format!(
                        "advance to {} would exceed declared length {}",
                        new_offset, total
                    )));
                }
            }
            session.offset = new_offset;
            session.parts.extend(update.new_parts);
            session.pending_tail = update.pending_tail;
            session.state = SessionState::Uploading;
            Ok(())
        })
    }

    async fn attach_multipart(
        &self,
        id: &str,
        handle: MultipartHandle,
    ) -> Result<Session, LedgerError> {
        self.mutate(id, |session| {
            if session.state.is_terminal() {
                return Err(LedgerError::Conflict(format!(
                    "upload {} is {:?}",
                    session.id, session.state
                )));
            }
            if session.multipart.is_some() {
                return Err(LedgerError::Conflict(format!(
                    "upload {} already has a multipart handle",
                    session.id
                )));
            }
            session.multipart = Some(handle);
            Ok(())
        })
    }

    async fn set_total_length(&self, id: &str, total: u64) -> Result<Session, LedgerError> {
        self.mutate(id, |session| {
            if session.state.is_terminal() {
                return Err(LedgerError::Conflict(format!(
                    "upload {} is {:?}",
                    session.id, session.state
                )));
            }
            session.total_length = Some(total);
            Ok(())
        })
    }

    async fn finalize(&self, id: &str) -> Result<Session, LedgerError> {
        self.mutate(id, |session| {
            match session.total_length {
                Some(total) if session.offset == total => {}
                Some(total) => {
                    return Err(LedgerError::IncompleteUpload {
                        offset: session.offset,
                        total,
                    })
                }
                None => {
                    return Err(LedgerError::Conflict(format!(
                        "upload {} has no declared length",
                        session.id
                    )))
                }
            }
            session.state = SessionState::Completed;
            // Terminal entries are retained as tombstones with the heavy
            // fields cleared; removal is left to the expiry collaborator.
            session.pending_tail = Bytes::new();
            session.multipart = None;
            session.parts = Vec::new();
            Ok(())
        })
    }

    async fn mark_aborted(&self, id: &str) -> Result<Session, LedgerError> {
        self.mutate(id, |session| {
            if session.state == SessionState::Completed {
                return Err(LedgerError::Conflict(format!(
                    "upload {} is already completed",
                    session.id
                )));
            }
            session.state = SessionState::Aborted;
            session.pending_tail = Bytes::new();
            session.multipart = None;
            session.parts = Vec::new();
            Ok(())
        })
    }

    async fn remove(&self, id: &str) -> Result<(), LedgerError> {
        self.sessions.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> HashMap<String, String> {
        HashMap::from([("filename".to_string(), "report.pdf".to_string())])
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let ledger = MemoryLedger::new();
        let session = ledger.create("u1", "bucket-1", Some(100), meta()).await.unwrap();
        assert_eq!(session.offset, 0);
        assert_eq!(session.state, SessionState::Created);

        let fetched = ledger.get("u1").await.unwrap();
        assert_eq!(fetched.total_length, Some(100));
        assert_eq!(fetched.metadata["filename"], "report.pdf");
    }

    #[tokio::test]
    async fn test_create_collision() {
        let ledger = MemoryLedger::new();
        ledger.create("u1", "bucket-1", None, HashMap::new()).await.unwrap();
        let err = ledger
            .create("u1", "bucket-1", None, HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_get_unknown() {
        let ledger = MemoryLedger::new();
        assert!(matches!(
            ledger.get("missing").await.unwrap_err(),
            LedgerError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_advance_updates_offset_and_parts() {
        let ledger = MemoryLedger::new();
        ledger.create("u1", "bucket-1", Some(20), HashMap::new()).await.unwrap();

        let session = ledger
            .advance(
                "u1",
                Advance {
                    delta: 12,
                    new_parts: vec![CompletedPart {
                        part_number: 1,
                        etag: "\"e1\"".into(),
                    }],
                    pending_tail: Bytes::from_static(b"abcd"),
                },
            )
            .await
            .unwrap();

        assert_eq!(session.offset, 12);
        assert_eq!(session.parts.len(), 1);
        assert_eq!(session.pending_tail.len(), 4);
        assert_eq!(session.state, SessionState::Uploading);
    }

    #[tokio::test]
    async fn test_advance_rejects_offset_overrun() {
        let ledger = MemoryLedger::new();
        ledger.create("u1", "bucket-1", Some(10), HashMap::new()).await.unwrap();

        let err = ledger
            .advance(
                "u1",
                Advance {
                    delta: 11,
                    new_parts: vec![],
                    pending_tail: Bytes::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));

        // Offset untouched by the failed advance
        assert_eq!(ledger.get("u1").await.unwrap().offset, 0);
    }

    #[tokio::test]
    async fn test_advance_rejects_terminal_session() {
        let ledger = MemoryLedger::new();
        ledger.create("u1", "bucket-1", Some(0), HashMap::new()).await.unwrap();
        ledger.finalize("u1").await.unwrap();

        let err = ledger
            .advance(
                "u1",
                Advance {
                    delta: 1,
                    new_parts: vec![],
                    pending_tail: Bytes::new(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_finalize_requires_full_offset() {
        let ledger = MemoryLedger::new();
        ledger.create("u1", "bucket-1", Some(10), HashMap::new()).await.unwrap();

        let err = ledger.finalize("u1").await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::IncompleteUpload { offset: 0, total: 10 }
        ));
        // State unchanged by the failed finalize
        assert_eq!(ledger.get("u1").await.unwrap().state, SessionState::Created);
    }

    #[tokio::test]
    async fn test_finalize_rejects_deferred_length() {
        let ledger = MemoryLedger::new();
        ledger.create("u1", "bucket-1", None, HashMap::new()).await.unwrap();
        assert!(matches!(
            ledger.finalize("u1").await.unwrap_err(),
            LedgerError::Conflict(_)
        ));
    }

    #[tokio::test]
    async fn test_mark_aborted_is_idempotent() {
        let ledger = MemoryLedger::new();
        ledger.create("u1", "bucket-1", None, HashMap::new()).await.unwrap();
        ledger.mark_aborted("u1").await.unwrap();
        let session = ledger.mark_aborted("u1").await.unwrap();
        assert_eq!(session.state, SessionState::Aborted);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let ledger = MemoryLedger::new();
        ledger.create("u1", "bucket-1", None, HashMap::new()).await.unwrap();
        ledger.remove("u1").await.unwrap();
        ledger.remove("u1").await.unwrap();
        assert!(ledger.is_empty());
    }
}
