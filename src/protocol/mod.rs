//! Protocol adapter
//!
//! Maps wire-level tus requests (method, headers, body) onto session
//! controller operations and back to HTTP responses. The `Tus-Resumable`
//! version token is required on every exchange except the capability probe.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{header, Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::auth::{AuthError, IdentityProvider};
use crate::metrics;
use crate::session::{Session, SessionController, UploadError};

/// Protocol version implemented by this server
pub const TUS_RESUMABLE: &str = "1.0.0";

/// Versions accepted from clients
pub const TUS_VERSION: &str = "1.0.0";

/// Extensions advertised on the capability probe
pub const TUS_EXTENSIONS: &str = "creation,creation-defer-length,termination";

const OFFSET_CONTENT_TYPE: &str = "application/offset+octet-stream";

/// Request parsing errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),
}

/// The closed set of wire operations this adapter serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TusRequest {
    /// OPTIONS capability-discovery probe
    Probe,
    /// POST {prefix} — create a session
    Create,
    /// HEAD {prefix}/{id} — offset query for resumption
    Head { id: String },
    /// PATCH {prefix}/{id} — contiguous byte-range append
    Append { id: String },
    /// DELETE {prefix}/{id} — cancel
    Terminate { id: String },
}

/// Parses request lines into tus operations
pub struct RequestParser {
    prefix: String,
}

impl RequestParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        while prefix.ends_with('/') {
            prefix.pop();
        }
        Self { prefix }
    }

    pub fn parse(&self, method: &Method, path: &str) -> Result<TusRequest, ParseError> {
        let rest = path
            .strip_prefix(&self.prefix)
            .ok_or_else(|| ParseError::NotFound(path.to_string()))?;
        // The prefix must end at a path-segment boundary
        if !rest.is_empty() && !rest.starts_with('/') {
            return Err(ParseError::NotFound(path.to_string()));
        }
        let id = rest.trim_matches('/');
        if id.contains('/') {
            return Err(ParseError::NotFound(path.to_string()));
        }

        match (method, id.is_empty()) {
            (&Method::OPTIONS, _) => Ok(TusRequest::Probe),
            (&Method::POST, true) => Ok(TusRequest::Create),
            (&Method::HEAD, false) => Ok(TusRequest::Head { id: id.to_string() }),
            (&Method::PATCH, false) => Ok(TusRequest::Append { id: id.to_string() }),
            (&Method::DELETE, false) => Ok(TusRequest::Terminate { id: id.to_string() }),
            (method, _) => Err(ParseError::MethodNotAllowed(method.to_string())),
        }
    }
}

/// Decode an `Upload-Metadata` header: comma-separated `key base64(value)`
/// pairs, value optional.
pub fn parse_metadata(header: &str) -> Result<HashMap<String, String>, String> {
    let mut metadata = HashMap::new();
    for pair in header.split(',') {
        let pair = pair.trim();
        if pair.is_empty() {
            continue;
        }
        let mut kv = pair.splitn(2, ' ');
        let key = kv.next().unwrap_or_default();
        if key.is_empty() {
            return Err("empty metadata key".into());
        }
        let value = match kv.next() {
            Some(encoded) => {
                let raw = BASE64
                    .decode(encoded)
                    .map_err(|e| format!("invalid base64 in metadata value: {e}"))?;
                String::from_utf8(raw).map_err(|_| "metadata value is not UTF-8".to_string())?
            }
            None => String::new(),
        };
        metadata.insert(key.to_string(), value);
    }
    Ok(metadata)
}

/// Re-encode metadata for the HEAD response, keys sorted for stability
pub fn encode_metadata(metadata: &HashMap<String, String>) -> String {
    let mut keys: Vec<_> = metadata.keys().collect();
    keys.sort();
    keys.iter()
        .map(|k| {
            if metadata[*k].is_empty() {
                (*k).clone()
            } else {
                format!("{} {}", k, BASE64.encode(&metadata[*k]))
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Wire adapter wiring HTTP requests to the session controller
pub struct ProtocolAdapter {
    controller: Arc<SessionController>,
    identity: Arc<dyn IdentityProvider>,
    parser: RequestParser,
    upload_path: String,
    max_size: u64,
    auth_required: bool,
    metrics_enabled: bool,
}

impl ProtocolAdapter {
    pub fn new(
        controller: Arc<SessionController>,
        identity: Arc<dyn IdentityProvider>,
        upload_path: impl Into<String>,
        max_size: u64,
        auth_required: bool,
        metrics_enabled: bool,
    ) -> Self {
        let upload_path = upload_path.into();
        Self {
            controller,
            identity,
            parser: RequestParser::new(upload_path.clone()),
            upload_path,
            max_size,
            auth_required,
            metrics_enabled,
        }
    }

    /// Serve one request. Never returns an error; failures become wire-level
    /// status codes.
    #[tracing::instrument(
        name = "http.request",
        skip(self, req),
        fields(http.method = %req.method(), http.path = %req.uri().path())
    )]
    pub async fn handle(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        // Some clients cannot issue PATCH or DELETE directly
        let mut method = req.method().clone();
        if let Some(override_header) = req
            .headers()
            .get("x-http-method-override")
            .and_then(|v| v.to_str().ok())
        {
            if let Ok(overridden) = override_header.to_uppercase().parse::<Method>() {
                method = overridden;
            }
        }
        let path = req.uri().path().to_string();

        if self.metrics_enabled && method == Method::GET && path == "/metrics" {
            return Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
                .body(Full::new(Bytes::from(metrics::render())))
                .unwrap();
        }

        let kind = match self.parser.parse(&method, &path) {
            Ok(kind) => kind,
            Err(ParseError::NotFound(_)) => {
                return self.error_response(StatusCode::NOT_FOUND, "Not found")
            }
            Err(err @ ParseError::MethodNotAllowed(_)) => {
                return self.error_response(StatusCode::METHOD_NOT_ALLOWED, &err.to_string())
            }
        };

        // Version token required on everything except the probe
        if kind != TusRequest::Probe {
            match req
                .headers()
                .get("tus-resumable")
                .and_then(|v| v.to_str().ok())
            {
                Some(TUS_RESUMABLE) => {}
                _ => {
                    return self
                        .error_response(StatusCode::PRECONDITION_FAILED, "Tus-Resumable Required")
                }
            }
        }

        match kind {
            TusRequest::Probe => self.probe_response(),
            TusRequest::Create => self.handle_create(req).await,
            TusRequest::Head { id } => self.handle_head(&id).await,
            TusRequest::Append { id } => self.handle_append(&id, req).await,
            TusRequest::Terminate { id } => self.handle_terminate(&id).await,
        }
    }

    fn probe_response(&self) -> Response<Full<Bytes>> {
        let mut builder = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Tus-Resumable", TUS_RESUMABLE)
            .header("Tus-Version", TUS_VERSION)
            .header("Tus-Extension", TUS_EXTENSIONS);
        if self.max_size > 0 {
            builder = builder.header("Tus-Max-Size", self.max_size);
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    async fn handle_create(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let authorization = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());

        if self.auth_required && authorization.is_none() {
            return self.error_response(StatusCode::FORBIDDEN, "Authorization required");
        }

        let grant = match self.identity.authorize(authorization.unwrap_or_default()).await {
            Ok(grant) => grant,
            Err(AuthError::Denied(reason)) => {
                tracing::warn!(reason = %reason, "session creation denied");
                return self.error_response(StatusCode::FORBIDDEN, &reason);
            }
            Err(AuthError::Upstream(reason)) => {
                tracing::error!(reason = %reason, "identity service failure");
                return self.error_response(StatusCode::BAD_GATEWAY, &reason);
            }
        };

        let upload_length = req
            .headers()
            .get("upload-length")
            .and_then(|v| v.to_str().ok());
        let defer_length = req
            .headers()
            .get("upload-defer-length")
            .and_then(|v| v.to_str().ok());

        let total_length = match (upload_length, defer_length) {
            (Some(_), Some(_)) => {
                return self.error_response(
                    StatusCode::BAD_REQUEST,
                    "Upload-Length and Upload-Defer-Length are mutually exclusive",
                )
            }
            (Some(raw), None) => match raw.parse::<u64>() {
                Ok(len) => Some(len),
                Err(_) => {
                    return self.error_response(StatusCode::BAD_REQUEST, "Invalid Upload-Length")
                }
            },
            (None, Some("1")) => None,
            (None, Some(_)) => {
                return self
                    .error_response(StatusCode::BAD_REQUEST, "Invalid Upload-Defer-Length")
            }
            (None, None) => {
                return self.error_response(
                    StatusCode::BAD_REQUEST,
                    "Upload-Length or Upload-Defer-Length required",
                )
            }
        };

        if self.max_size > 0 {
            if let Some(len) = total_length {
                if len > self.max_size {
                    return self
                        .error_response(StatusCode::PAYLOAD_TOO_LARGE, "Upload too large");
                }
            }
        }

        let metadata = match req
            .headers()
            .get("upload-metadata")
            .and_then(|v| v.to_str().ok())
        {
            Some(raw) => match parse_metadata(raw) {
                Ok(metadata) => metadata,
                Err(reason) => return self.error_response(StatusCode::BAD_REQUEST, &reason),
            },
            None => HashMap::new(),
        };

        match self
            .controller
            .initiate(&grant.namespace, total_length, metadata)
            .await
        {
            Ok(session) => {
                let mut builder = Response::builder()
                    .status(StatusCode::CREATED)
                    .header("Tus-Resumable", TUS_RESUMABLE)
                    .header(
                        header::LOCATION,
                        format!("{}/{}", self.upload_path, session.id),
                    );
                if let Some(total) = session.total_length {
                    builder = builder.header("Upload-Length", total);
                }
                builder.body(Full::new(Bytes::new())).unwrap()
            }
            Err(err) => self.upload_error_response(err),
        }
    }

    async fn handle_head(&self, id: &str) -> Response<Full<Bytes>> {
        match self.controller.status(id).await {
            Ok(session) => self.status_response(&session),
            Err(err) => self.upload_error_response(err),
        }
    }

    fn status_response(&self, session: &Session) -> Response<Full<Bytes>> {
        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header("Tus-Resumable", TUS_RESUMABLE)
            .header("Upload-Offset", session.offset)
            .header(header::CACHE_CONTROL, "no-store");
        match session.total_length {
            Some(total) => builder = builder.header("Upload-Length", total),
            None => builder = builder.header("Upload-Defer-Length", "1"),
        }
        if !session.metadata.is_empty() {
            builder = builder.header("Upload-Metadata", encode_metadata(&session.metadata));
        }
        builder.body(Full::new(Bytes::new())).unwrap()
    }

    async fn handle_append(&self, id: &str, req: Request<Incoming>) -> Response<Full<Bytes>> {
        match req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            Some(content_type) if content_type.starts_with(OFFSET_CONTENT_TYPE) => {}
            _ => {
                return self.error_response(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "Content-Type must be application/offset+octet-stream",
                )
            }
        }

        let expected_offset = match req
            .headers()
            .get("upload-offset")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(offset) => offset,
            None => {
                return self
                    .error_response(StatusCode::PRECONDITION_FAILED, "Invalid Upload-Offset")
            }
        };

        // A deferred-length upload fixes its total on the final append
        let declared_length = match req
            .headers()
            .get("upload-length")
            .and_then(|v| v.to_str().ok())
        {
            Some(raw) => match raw.parse::<u64>() {
                Ok(len) => Some(len),
                Err(_) => {
                    return self.error_response(StatusCode::BAD_REQUEST, "Invalid Upload-Length")
                }
            },
            None => None,
        };

        let body = match req.into_body().collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                tracing::warn!(error = %err, "failed to read append body");
                return self.error_response(StatusCode::BAD_REQUEST, "Failed to read body");
            }
        };

        if let Some(total) = declared_length {
            if let Err(err) = self.controller.set_deferred_length(id, total).await {
                return self.upload_error_response(err);
            }
        }

        match self.controller.append(id, expected_offset, body).await {
            Ok(session) => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header("Tus-Resumable", TUS_RESUMABLE)
                .header("Upload-Offset", session.offset)
                .body(Full::new(Bytes::new()))
                .unwrap(),
            Err(err) => self.upload_error_response(err),
        }
    }

    async fn handle_terminate(&self, id: &str) -> Response<Full<Bytes>> {
        match self.controller.cancel(id).await {
            Ok(_) => Response::builder()
                .status(StatusCode::NO_CONTENT)
                .header("Tus-Resumable", TUS_RESUMABLE)
                .body(Full::new(Bytes::new()))
                .unwrap(),
            Err(err) => self.upload_error_response(err),
        }
    }

    fn upload_error_response(&self, err: UploadError) -> Response<Full<Bytes>> {
        let status = match &err {
            UploadError::NotFound(_) => StatusCode::NOT_FOUND,
            UploadError::AlreadyExists(_)
            | UploadError::OffsetMismatch { .. }
            | UploadError::Conflict(_)
            | UploadError::IncompleteUpload { .. } => StatusCode::CONFLICT,
            UploadError::InvalidLength | UploadError::LengthAlreadySet => StatusCode::BAD_REQUEST,
            UploadError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::StorageWriteFailed { .. } | UploadError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        self.error_response(status, &err.to_string())
    }

    fn error_response(&self, status: StatusCode, message: &str) -> Response<Full<Bytes>> {
        Response::builder()
            .status(status)
            .header("Tus-Resumable", TUS_RESUMABLE)
            .body(Full::new(Bytes::from(format!("{message}\n"))))
            .unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_probe() {
        let parser = RequestParser::new("/files");
        assert_eq!(
            parser.parse(&Method::OPTIONS, "/files").unwrap(),
            TusRequest::Probe
        );
    }

    #[test]
    fn test_parse_create() {
        let parser = RequestParser::new("/files");
        assert_eq!(
            parser.parse(&Method::POST, "/files").unwrap(),
            TusRequest::Create
        );
        assert_eq!(
            parser.parse(&Method::POST, "/files/").unwrap(),
            TusRequest::Create
        );
    }

    #[test]
    fn test_parse_session_operations() {
        let parser = RequestParser::new("/files");
        assert_eq!(
            parser.parse(&Method::HEAD, "/files/u123").unwrap(),
            TusRequest::Head { id: "u123".into() }
        );
        assert_eq!(
            parser.parse(&Method::PATCH, "/files/u123").unwrap(),
            TusRequest::Append { id: "u123".into() }
        );
        assert_eq!(
            parser.parse(&Method::DELETE, "/files/u123").unwrap(),
            TusRequest::Terminate { id: "u123".into() }
        );
    }

    #[test]
    fn test_parse_rejects_foreign_paths() {
        let parser = RequestParser::new("/files");
        assert!(matches!(
            parser.parse(&Method::POST, "/other").unwrap_err(),
            ParseError::NotFound(_)
        ));
        assert!(matches!(
            parser.parse(&Method::PATCH, "/files/a/b").unwrap_err(),
            ParseError::NotFound(_)
        ));
        // Prefix match must not bleed into a longer first segment
        assert!(matches!(
            parser.parse(&Method::HEAD, "/filesystem").unwrap_err(),
            ParseError::NotFound(_)
        ));
    }

    #[test]
    fn test_parse_rejects_wrong_method() {
        let parser = RequestParser::new("/files");
        assert!(matches!(
            parser.parse(&Method::GET, "/files/u123").unwrap_err(),
            ParseError::MethodNotAllowed(_)
        ));
        // PATCH on the collection has no target session
        assert!(matches!(
            parser.parse(&Method::PATCH, "/files").unwrap_err(),
            ParseError::MethodNotAllowed(_)
        ));
    }

    #[test]
    fn test_parse_metadata_pairs() {
        let metadata =
            parse_metadata("filename cmVwb3J0LnBkZg==,confidential").unwrap();
        assert_eq!(metadata["filename"], "report.pdf");
        assert_eq!(metadata["confidential"], "");
    }

    #[test]
    fn test_parse_metadata_rejects_bad_base64() {
        assert!(parse_metadata("filename not-base64!!!").is_err());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let metadata = HashMap::from([
            ("filename".to_string(), "report.pdf".to_string()),
            ("flag".to_string(), String::new()),
        ]);
        let encoded = encode_metadata(&metadata);
        assert_eq!(parse_metadata(&encoded).unwrap(), metadata);
    }
}
