//! Session controller
//!
//! Orchestrates creation, append, status, deferred-length fixing, completion
//! and cancellation against the ledger, part assembler and storage backend.
//!
//! # Concurrency
//!
//! Requests are handled in parallel, but every mutating operation on a given
//! session id serializes on a per-session `tokio::Mutex` held across storage
//! calls. Two concurrent appends declaring the same offset cannot both
//! succeed: the loser observes the advanced offset and fails with
//! `OffsetMismatch`. Status reads take a ledger snapshot without the lock.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::assembler::{PartAssembler, PartPayload, MAX_PARTS};
use super::ledger::{Advance, Ledger};
use super::{CompletedPart, MultipartHandle, Session, SessionState, UploadError};
use crate::metrics;
use crate::storage::{StorageBackend, StorageError};

/// Default bounded retry for transient part-upload failures
const DEFAULT_MAX_UPLOAD_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(200);

/// Lifecycle events observable via [`SessionController::on_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Created { id: String },
    Progress { id: String, offset: u64 },
    Completed { id: String },
    Aborted { id: String },
}

type EventHook = Box<dyn Fn(&SessionEvent) + Send + Sync>;

/// Upload session orchestrator
pub struct SessionController {
    ledger: Arc<dyn Ledger>,
    storage: Arc<dyn StorageBackend>,
    assembler: PartAssembler,
    locks: DashMap<String, Arc<Mutex<()>>>,
    hooks: RwLock<Vec<EventHook>>,
    max_upload_attempts: u32,
    retry_base_delay: Duration,
}

impl SessionController {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        storage: Arc<dyn StorageBackend>,
        part_size: usize,
    ) -> Self {
        Self {
            ledger,
            storage,
            assembler: PartAssembler::new(part_size),
            locks: DashMap::new(),
            hooks: RwLock::new(Vec::new()),
            max_upload_attempts: DEFAULT_MAX_UPLOAD_ATTEMPTS,
            retry_base_delay: DEFAULT_RETRY_BASE_DELAY,
        }
    }

    /// Override the retry bound and backoff base (tests use short delays)
    pub fn with_retry(mut self, max_attempts: u32, base_delay: Duration) -> Self {
        self.max_upload_attempts = max_attempts.max(1);
        self.retry_base_delay = base_delay;
        self
    }

    /// Register an observer for session lifecycle events
    pub fn on_event<F>(&self, hook: F)
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.hooks.write().push(Box::new(hook));
    }

    fn emit(&self, event: SessionEvent) {
        for hook in self.hooks.read().iter() {
            hook(&event);
        }
    }

    fn session_lock(&self, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create a new upload session.
    ///
    /// `total_length: None` defers the length; it must be fixed via
    /// [`set_deferred_length`](Self::set_deferred_length) before completion.
    #[tracing::instrument(
        name = "session.initiate",
        skip(self, metadata),
        fields(upload.namespace = %namespace, upload.total_length = ?total_length),
        err
    )]
    pub async fn initiate(
        &self,
        namespace: &str,
        total_length: Option<u64>,
        metadata: HashMap<String, String>,
    ) -> Result<Session, UploadError> {
        let id = Uuid::new_v4().simple().to_string();
        let session = self
            .ledger
            .create(&id, namespace, total_length, metadata)
            .await?;

        metrics::record_session_created();
        tracing::info!(upload.id = %id, "upload session created");
        self.emit(SessionEvent::Created { id });
        Ok(session)
    }

    /// Append a contiguous byte range at `expected_offset`.
    ///
    /// The ledger offset advances only after every emitted part is confirmed
    /// by storage; a failed append leaves the session resumable from its last
    /// confirmed offset. Triggers completion when the offset reaches a known
    /// total length.
    #[tracing::instrument(
        name = "session.append",
        skip(self, data),
        fields(upload.id = %id, upload.expected_offset = expected_offset, upload.bytes = data.len()),
        err
    )]
    pub async fn append(
        &self,
        id: &str,
        expected_offset: u64,
        data: Bytes,
    ) -> Result<Session, UploadError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        let start = Instant::now();

        let result = self.append_locked(id, expected_offset, data).await;
        match &result {
            Ok(session) => {
                metrics::record_append(
                    session.offset - expected_offset,
                    start.elapsed().as_secs_f64(),
                );
            }
            Err(err) => {
                metrics::record_append_failure(start.elapsed().as_secs_f64());
                metrics::record_error(error_label(err));
            }
        }
        self.release_if_terminal(id, &result);
        result
    }

    /// Terminal sessions accept no further mutation; their lock entry can go.
    /// Waiters already holding the Arc still release cleanly.
    fn release_if_terminal(&self, id: &str, result: &Result<Session, UploadError>) {
        if matches!(result, Ok(session) if session.state.is_terminal()) {
            self.locks.remove(id);
        }
    }

    async fn append_locked(
        &self,
        id: &str,
        expected_offset: u64,
        data: Bytes,
    ) -> Result<Session, UploadError> {
        let session = self.ledger.get(id).await?;

        if session.state.is_terminal() {
            return Err(UploadError::Conflict(format!(
                "upload {} is {:?}",
                id, session.state
            )));
        }
        if expected_offset != session.offset {
            return Err(UploadError::OffsetMismatch {
                expected: expected_offset,
                current: session.offset,
            });
        }
        if let Some(total) = session.total_length {
            if session.offset + data.len() as u64 > total {
                return Err(UploadError::PayloadTooLarge);
            }
        }

        let delta = data.len() as u64;
        let outcome = self
            .assembler
            .feed(session.pending_tail.clone(), data, session.next_part_number());

        // Checked before any upload so a rejected append never stores parts
        if let Some(last) = outcome.parts.last() {
            if last.part_number > MAX_PARTS {
                return Err(UploadError::Conflict(format!(
                    "upload would exceed the {MAX_PARTS}-part storage limit"
                )));
            }
        }

        let mut handle = session.multipart.clone();
        if handle.is_none() && !outcome.parts.is_empty() {
            handle = Some(self.ensure_multipart(&session).await?);
        }

        let mut new_parts = Vec::with_capacity(outcome.parts.len());
        for part in outcome.parts {
            // handle is always Some here; emitted parts forced its creation
            let handle = handle.as_ref().ok_or_else(|| {
                UploadError::Conflict("multipart handle missing for emitted part".into())
            })?;
            let etag = self.upload_part_with_retry(handle, part).await?;
            new_parts.push(etag);
        }

        let updated = self
            .ledger
            .advance(
                id,
                Advance {
                    delta,
                    new_parts,
                    pending_tail: outcome.pending_tail,
                },
            )
            .await?;

        tracing::debug!(
            upload.id = %id,
            upload.offset = updated.offset,
            upload.parts = updated.parts.len(),
            "append accepted"
        );
        self.emit(SessionEvent::Progress {
            id: id.to_string(),
            offset: updated.offset,
        });

        if updated.total_length == Some(updated.offset) {
            return self.complete_locked(id).await;
        }
        Ok(updated)
    }

    /// Finish the upload: flush the buffered tail, commit the part list and
    /// finalize the ledger entry.
    ///
    /// Any failure leaves the session in `Uploading`; completion can be
    /// retried by a later zero-length append or an explicit call.
    #[tracing::instrument(name = "session.complete", skip(self), fields(upload.id = %id), err)]
    pub async fn complete(&self, id: &str) -> Result<Session, UploadError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;
        let result = self.complete_locked(id).await;
        self.release_if_terminal(id, &result);
        result
    }

    async fn complete_locked(&self, id: &str) -> Result<Session, UploadError> {
        let session = self.ledger.get(id).await?;
        match session.state {
            SessionState::Completed => return Ok(session),
            SessionState::Aborted => {
                return Err(UploadError::Conflict(format!("upload {id} is aborted")))
            }
            _ => {}
        }

        let total = session.total_length.ok_or_else(|| {
            UploadError::Conflict(format!("upload {id} has no declared length"))
        })?;
        if session.offset != total {
            return Err(UploadError::IncompleteUpload {
                offset: session.offset,
                total,
            });
        }

        // Flush the undersized tail as the terminal part. The bytes were
        // already counted into the offset when buffered, so delta is zero.
        let mut session = session;
        if !session.pending_tail.is_empty() && session.next_part_number() > MAX_PARTS {
            return Err(UploadError::Conflict(format!(
                "upload would exceed the {MAX_PARTS}-part storage limit"
            )));
        }
        if let Some(part) = self
            .assembler
            .flush_final(session.pending_tail.clone(), session.next_part_number())
        {
            let handle = match session.multipart.clone() {
                Some(handle) => handle,
                None => self.ensure_multipart(&session).await?,
            };
            let completed = self.upload_part_with_retry(&handle, part).await?;
            session = self
                .ledger
                .advance(
                    id,
                    Advance {
                        delta: 0,
                        new_parts: vec![completed],
                        pending_tail: Bytes::new(),
                    },
                )
                .await?;
        }

        let parts_count = session.parts.len();
        if let Some(handle) = &session.multipart {
            let mut parts = session.parts.clone();
            parts.sort_by_key(|p| p.part_number);
            // Part-set mismatches are not retried blindly: a lost part means
            // the client must re-verify the offset and resume.
            self.storage.complete_multipart(handle, &parts).await?;
        }

        let finalized = self.ledger.finalize(id).await?;
        metrics::record_session_completed(parts_count);
        tracing::info!(upload.id = %id, parts = parts_count, "upload completed");
        self.emit(SessionEvent::Completed { id: id.to_string() });
        Ok(finalized)
    }

    /// Fix the total length of a deferred-length upload.
    ///
    /// Completion is not triggered here even if the offset already matches;
    /// the final append (possibly zero-length) drives the flush-and-complete
    /// sequence.
    #[tracing::instrument(
        name = "session.set_length",
        skip(self),
        fields(upload.id = %id, upload.total_length = total_length),
        err
    )]
    pub async fn set_deferred_length(
        &self,
        id: &str,
        total_length: u64,
    ) -> Result<Session, UploadError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let session = self.ledger.get(id).await?;
        if session.state.is_terminal() {
            return Err(UploadError::Conflict(format!(
                "upload {} is {:?}",
                id, session.state
            )));
        }
        if session.total_length.is_some() {
            return Err(UploadError::LengthAlreadySet);
        }
        if total_length < session.offset {
            return Err(UploadError::InvalidLength);
        }

        Ok(self.ledger.set_total_length(id, total_length).await?)
    }

    /// Consistent read-only snapshot, used for resumption after reconnect
    pub async fn status(&self, id: &str) -> Result<Session, UploadError> {
        Ok(self.ledger.get(id).await?)
    }

    /// Cancel the upload and release uncommitted storage parts.
    ///
    /// Idempotent: cancelling a terminal session succeeds without contacting
    /// storage. A failed backend abort is logged and swallowed; orphaned
    /// parts are acceptable collateral.
    #[tracing::instrument(name = "session.cancel", skip(self), fields(upload.id = %id), err)]
    pub async fn cancel(&self, id: &str) -> Result<Session, UploadError> {
        let lock = self.session_lock(id);
        let _guard = lock.lock().await;

        let session = self.ledger.get(id).await?;
        if session.state.is_terminal() {
            self.locks.remove(id);
            return Ok(session);
        }

        if let Some(handle) = &session.multipart {
            if let Err(err) = self.storage.abort_multipart(handle).await {
                tracing::warn!(
                    upload.id = %id,
                    error = %err,
                    "abort failed; leaving orphaned parts behind"
                );
                metrics::record_error("abort_multipart");
            }
        }

        let aborted = self.ledger.mark_aborted(id).await?;
        metrics::record_session_aborted();
        tracing::info!(upload.id = %id, "upload cancelled");
        self.emit(SessionEvent::Aborted { id: id.to_string() });
        self.locks.remove(id);
        Ok(aborted)
    }

    async fn ensure_multipart(&self, session: &Session) -> Result<MultipartHandle, UploadError> {
        let handle = self
            .storage
            .begin_multipart(&session.namespace, &session.id)
            .await?;
        self.ledger.attach_multipart(&session.id, handle.clone()).await?;
        Ok(handle)
    }

    /// Upload one part, retrying transient failures with exponential backoff
    /// up to the configured bound. Exhausted or fatal failures surface as
    /// `StorageWriteFailed` and the ledger offset is never advanced.
    async fn upload_part_with_retry(
        &self,
        handle: &MultipartHandle,
        part: PartPayload,
    ) -> Result<CompletedPart, UploadError> {
        let mut attempt = 1;
        loop {
            match self
                .storage
                .upload_part(handle, part.part_number, part.bytes.clone())
                .await
            {
                Ok(etag) => {
                    return Ok(CompletedPart {
                        part_number: part.part_number,
                        etag,
                    })
                }
                Err(err) if err.is_transient() && attempt < self.max_upload_attempts => {
                    let delay = self.retry_base_delay * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        part_number = part.part_number,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient part upload failure; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    return Err(UploadError::StorageWriteFailed {
                        attempts: attempt,
                        source: err,
                    })
                }
            }
        }
    }
}

fn error_label(err: &UploadError) -> &'static str {
    match err {
        UploadError::NotFound(_) => "not_found",
        UploadError::AlreadyExists(_) => "already_exists",
        UploadError::OffsetMismatch { .. } => "offset_mismatch",
        UploadError::InvalidLength => "invalid_length",
        UploadError::LengthAlreadySet => "length_already_set",
        UploadError::IncompleteUpload { .. } => "incomplete_upload",
        UploadError::PayloadTooLarge => "payload_too_large",
        UploadError::Conflict(_) => "conflict",
        UploadError::StorageWriteFailed { .. } => "storage_write_failed",
        UploadError::Storage(StorageError::Unavailable(_)) => "storage_unavailable",
        UploadError::Storage(StorageError::IncompletePartSet(_)) => "incomplete_part_set",
        UploadError::Storage(_) => "storage",
    }
}
