//! In-memory storage backend
//!
//! Used by tests and local development. Enforces the same contract shape as
//! S3: parts are keyed by number, completion validates contiguity and etags,
//! abort is idempotent. Supports injected transient failures for exercising
//! the controller's retry path.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use uuid::Uuid;

use super::{ObjectDescriptor, StorageBackend, StorageError};
use crate::session::{CompletedPart, MultipartHandle};

#[derive(Debug, Default)]
struct PendingUpload {
    namespace: String,
    key: String,
    // part_number -> (etag, bytes)
    parts: std::collections::BTreeMap<u32, (String, Bytes)>,
}

/// In-process multipart store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    pending: DashMap<String, PendingUpload>,
    objects: DashMap<String, Bytes>,
    fail_uploads: AtomicU32,
    fail_completes: AtomicU32,
    upload_calls: AtomicU64,
    abort_calls: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` `upload_part` calls fail with a transient error
    pub fn fail_next_uploads(&self, n: u32) {
        self.fail_uploads.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` `complete_multipart` calls fail with a part-set error
    pub fn fail_next_completes(&self, n: u32) {
        self.fail_completes.store(n, Ordering::SeqCst);
    }

    /// Committed object content, if `complete_multipart` has run for this key
    pub fn object(&self, namespace: &str, key: &str) -> Option<Bytes> {
        self.objects
            .get(&object_key(namespace, key))
            .map(|entry| entry.value().clone())
    }

    /// Uploads begun but not yet committed or aborted
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Number of parts stored, for asserting nothing was re-uploaded
    pub fn upload_calls(&self) -> u64 {
        self.upload_calls.load(Ordering::SeqCst)
    }

    /// Number of abort calls observed, for asserting no-contact paths
    pub fn abort_calls(&self) -> u64 {
        self.abort_calls.load(Ordering::SeqCst)
    }
}

fn object_key(namespace: &str, key: &str) -> String {
    format!("{namespace}/{key}")
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn begin_multipart(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<MultipartHandle, StorageError> {
        let upload_id = Uuid::new_v4().simple().to_string();
        self.pending.insert(
            upload_id.clone(),
            PendingUpload {
                namespace: namespace.to_string(),
                key: key.to_string(),
                parts: Default::default(),
            },
        );
        Ok(MultipartHandle {
            namespace: namespace.to_string(),
            key: key.to_string(),
            upload_id,
        })
    }

    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        if self
            .fail_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::Unavailable("injected failure".into()));
        }

        let mut upload = self
            .pending
            .get_mut(&handle.upload_id)
            .ok_or_else(|| StorageError::Backend(format!("no such upload {}", handle.upload_id)))?;

        let etag = format!("\"mem-{}-{}\"", part_number, body.len());
        // Same part number replaces the earlier attempt, as S3 does.
        upload.parts.insert(part_number, (etag.clone(), body));
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor, StorageError> {
        if self
            .fail_completes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StorageError::IncompletePartSet(
                "injected completion failure".into(),
            ));
        }

        let (_, upload) = self
            .pending
            .remove(&handle.upload_id)
            .ok_or_else(|| StorageError::Backend(format!("no such upload {}", handle.upload_id)))?;

        let mut assembled = Vec::new();
        for (i, part) in parts.iter().enumerate() {
            if part.part_number != i as u32 + 1 {
                self.pending.insert(handle.upload_id.clone(), upload);
                return Err(StorageError::IncompletePartSet(format!(
                    "non-contiguous part number {} at position {}",
                    part.part_number, i
                )));
            }
            match upload.parts.get(&part.part_number) {
                Some((etag, bytes)) if *etag == part.etag => assembled.extend_from_slice(bytes),
                _ => {
                    self.pending.insert(handle.upload_id.clone(), upload);
                    return Err(StorageError::IncompletePartSet(format!(
                        "part {} missing or etag mismatch",
                        part.part_number
                    )));
                }
            }
        }

        let etag = format!("\"{}-{}\"", Uuid::new_v4().simple(), parts.len());
        self.objects.insert(
            object_key(&upload.namespace, &upload.key),
            Bytes::from(assembled),
        );

        Ok(ObjectDescriptor {
            namespace: upload.namespace,
            key: upload.key,
            etag,
        })
    }

    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<(), StorageError> {
        self.abort_calls.fetch_add(1, Ordering::SeqCst);
        self.pending.remove(&handle.upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multipart_roundtrip() {
        let backend = MemoryBackend::new();
        let handle = backend.begin_multipart("bucket-1", "file").await.unwrap();

        let e1 = backend
            .upload_part(&handle, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let e2 = backend
            .upload_part(&handle, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();

        let descriptor = backend
            .complete_multipart(
                &handle,
                &[
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 2, etag: e2 },
                ],
            )
            .await
            .unwrap();

        assert_eq!(descriptor.key, "file");
        assert_eq!(
            backend.object("bucket-1", "file").unwrap(),
            Bytes::from_static(b"hello world")
        );
        assert_eq!(backend.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_complete_rejects_gap_in_part_numbers() {
        let backend = MemoryBackend::new();
        let handle = backend.begin_multipart("bucket-1", "file").await.unwrap();
        let e1 = backend
            .upload_part(&handle, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();
        let e3 = backend
            .upload_part(&handle, 3, Bytes::from_static(b"c"))
            .await
            .unwrap();

        let err = backend
            .complete_multipart(
                &handle,
                &[
                    CompletedPart { part_number: 1, etag: e1 },
                    CompletedPart { part_number: 3, etag: e3 },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::IncompletePartSet(_)));
        // Upload survives the failed completion and can be retried
        assert_eq!(backend.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_complete_rejects_etag_mismatch() {
        let backend = MemoryBackend::new();
        let handle = backend.begin_multipart("bucket-1", "file").await.unwrap();
        backend
            .upload_part(&handle, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();

        let err = backend
            .complete_multipart(
                &handle,
                &[CompletedPart {
                    part_number: 1,
                    etag: "\"bogus\"".into(),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::IncompletePartSet(_)));
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let backend = MemoryBackend::new();
        let handle = backend.begin_multipart("bucket-1", "file").await.unwrap();
        backend.abort_multipart(&handle).await.unwrap();
        backend.abort_multipart(&handle).await.unwrap();
        assert_eq!(backend.pending_count(), 0);
        assert_eq!(backend.abort_calls(), 2);
    }

    #[tokio::test]
    async fn test_injected_completion_failure_keeps_upload_pending() {
        let backend = MemoryBackend::new();
        let handle = backend.begin_multipart("bucket-1", "file").await.unwrap();
        let e1 = backend
            .upload_part(&handle, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();
        let parts = [CompletedPart {
            part_number: 1,
            etag: e1,
        }];

        backend.fail_next_completes(1);
        let err = backend.complete_multipart(&handle, &parts).await.unwrap_err();
        assert!(matches!(err, StorageError::IncompletePartSet(_)));
        assert_eq!(backend.pending_count(), 1);

        // Retry commits with the same part list
        backend.complete_multipart(&handle, &parts).await.unwrap();
        assert_eq!(
            backend.object("bucket-1", "file").unwrap(),
            Bytes::from_static(b"a")
        );
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let backend = MemoryBackend::new();
        let handle = backend.begin_multipart("bucket-1", "file").await.unwrap();
        backend.fail_next_uploads(1);

        let err = backend
            .upload_part(&handle, 1, Bytes::from_static(b"a"))
            .await
            .unwrap_err();
        assert!(err.is_transient());

        // Next attempt goes through
        backend
            .upload_part(&handle, 1, Bytes::from_static(b"a"))
            .await
            .unwrap();
    }
}
