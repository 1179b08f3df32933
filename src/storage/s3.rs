//! S3 storage backend
//!
//! Maps the multipart contract onto the AWS S3 multipart API. Works against
//! AWS or any S3-compatible endpoint (MinIO, Wasabi) via `endpoint` override.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::{ObjectDescriptor, StorageBackend, StorageError};
use crate::config::StoreConfig;
use crate::session::{CompletedPart, MultipartHandle};

/// S3-backed multipart storage
pub struct S3Backend {
    client: Client,
}

impl S3Backend {
    /// Wrap an already-configured SDK client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from the store configuration.
    ///
    /// Explicit credentials in the config take precedence; otherwise the
    /// default AWS credential chain applies.
    pub async fn from_config(config: &StoreConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()));

        if let (Some(access_key), Some(secret_key)) = (&config.access_key, &config.secret_key) {
            loader = loader.credentials_provider(Credentials::new(
                access_key.clone(),
                secret_key.clone(),
                None,
                None,
                "store-config",
            ));
        }

        let shared = loader.load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared).force_path_style(true);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint.clone());
        }

        Self {
            client: Client::from_conf(builder.build()),
        }
    }
}

/// Classify an SDK error into the storage taxonomy.
///
/// Transport failures and throttling are transient; part-set mismatches on
/// completion are fatal and must not be retried blindly.
fn classify<E, R>(op: &str, err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::fmt::Debug,
    R: std::fmt::Debug,
{
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            StorageError::Unavailable(format!("{op}: {err:?}"))
        }
        SdkError::ServiceError(_) => match err.code() {
            Some("InvalidPart") | Some("InvalidPartOrder") | Some("NoSuchUpload") => {
                StorageError::IncompletePartSet(format!(
                    "{op}: {}",
                    err.message().unwrap_or("part set rejected")
                ))
            }
            Some("SlowDown") | Some("InternalError") | Some("ServiceUnavailable")
            | Some("RequestTimeout") => StorageError::Unavailable(format!(
                "{op}: {}",
                err.message().unwrap_or("transient service error")
            )),
            code => StorageError::Backend(format!("{op}: {}", code.unwrap_or("unknown error"))),
        },
        _ => StorageError::Backend(format!("{op}: {err:?}")),
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    #[tracing::instrument(
        name = "s3.create_multipart_upload",
        skip(self),
        fields(s3.bucket = %namespace, s3.key = %key),
        err
    )]
    async fn begin_multipart(
        &self,
        namespace: &str,
        key: &str,
    ) -> Result<MultipartHandle, StorageError> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(namespace)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("CreateMultipartUpload", e))?;

        let upload_id = output
            .upload_id()
            .ok_or_else(|| {
                StorageError::Backend("CreateMultipartUpload returned no upload id".into())
            })?
            .to_string();

        tracing::info!(upload_id = %upload_id, "created multipart upload");

        Ok(MultipartHandle {
            namespace: namespace.to_string(),
            key: key.to_string(),
            upload_id,
        })
    }

    #[tracing::instrument(
        name = "s3.upload_part",
        skip(self, body),
        fields(
            s3.bucket = %handle.namespace,
            s3.upload_id = %handle.upload_id,
            s3.part_number = part_number,
            upload.bytes = body.len()
        ),
        err
    )]
    async fn upload_part(
        &self,
        handle: &MultipartHandle,
        part_number: u32,
        body: Bytes,
    ) -> Result<String, StorageError> {
        let output = self
            .client
            .upload_part()
            .bucket(&handle.namespace)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .part_number(part_number as i32)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| classify("UploadPart", e))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StorageError::Backend("UploadPart returned no etag".into()))
    }

    #[tracing::instrument(
        name = "s3.complete_multipart_upload",
        skip(self, parts),
        fields(
            s3.bucket = %handle.namespace,
            s3.upload_id = %handle.upload_id,
            parts_count = parts.len()
        ),
        err
    )]
    async fn complete_multipart(
        &self,
        handle: &MultipartHandle,
        parts: &[CompletedPart],
    ) -> Result<ObjectDescriptor, StorageError> {
        let completed_parts: Vec<S3CompletedPart> = parts
            .iter()
            .map(|p| {
                S3CompletedPart::builder()
                    .part_number(p.part_number as i32)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect();

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(&handle.namespace)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed_parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("CompleteMultipartUpload", e))?;

        let etag = output.e_tag().unwrap_or_default().to_string();
        tracing::info!(etag = %etag, parts = parts.len(), "completed multipart upload");

        Ok(ObjectDescriptor {
            namespace: handle.namespace.clone(),
            key: handle.key.clone(),
            etag,
        })
    }

    #[tracing::instrument(
        name = "s3.abort_multipart_upload",
        skip(self),
        fields(s3.bucket = %handle.namespace, s3.upload_id = %handle.upload_id),
        err
    )]
    async fn abort_multipart(&self, handle: &MultipartHandle) -> Result<(), StorageError> {
        match self
            .client
            .abort_multipart_upload()
            .bucket(&handle.namespace)
            .key(&handle.key)
            .upload_id(&handle.upload_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            // Aborting an upload the backend no longer knows about is a no-op.
            Err(e) if e.code() == Some("NoSuchUpload") => Ok(()),
            Err(e) => Err(classify("AbortMultipartUpload", e)),
        }
    }
}
