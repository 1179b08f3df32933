//! Identity service integration
//!
//! Session creation is authorized against an external identity service,
//! which also hands back the opaque storage namespace (bucket) the upload
//! belongs to. The core treats the namespace as an opaque string and calls
//! the provider once per creation request, never per append.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::metrics;

/// Authorization errors
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("authorization denied: {0}")]
    Denied(String),

    #[error("identity service error: {0}")]
    Upstream(String),
}

/// A granted authorization: the storage namespace this caller may upload into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub namespace: String,
}

/// Authorization decision point for session creation
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authorize(&self, authorization: &str) -> Result<AuthGrant, AuthError>;
}

#[derive(Debug, Deserialize)]
struct IdentityResponse {
    id: i64,
}

/// Identity provider backed by an HTTP service.
///
/// Forwards the caller's `Authorization` header; a 2xx response carries the
/// account id from which the storage namespace is derived.
pub struct HttpIdentityProvider {
    client: reqwest::Client,
    url: String,
}

impl HttpIdentityProvider {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    #[tracing::instrument(name = "auth.authorize", skip(self, authorization), err)]
    async fn authorize(&self, authorization: &str) -> Result<AuthGrant, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::AUTHORIZATION, authorization)
            .send()
            .await
            .map_err(|e| {
                metrics::record_auth_attempt(false);
                AuthError::Upstream(e.to_string())
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            metrics::record_auth_attempt(false);
            return Err(AuthError::Denied(format!(
                "identity service returned {status}"
            )));
        }
        if !status.is_success() {
            metrics::record_auth_attempt(false);
            return Err(AuthError::Upstream(format!(
                "identity service returned {status}"
            )));
        }

        let identity: IdentityResponse = response.json().await.map_err(|e| {
            metrics::record_auth_attempt(false);
            AuthError::Upstream(format!("malformed identity response: {e}"))
        })?;

        metrics::record_auth_attempt(true);
        Ok(AuthGrant {
            namespace: format!("bucket-{}", identity.id),
        })
    }
}

/// Provider used when auth is disabled: every caller gets the configured
/// default namespace.
pub struct StaticIdentityProvider {
    namespace: String,
}

impl StaticIdentityProvider {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authorize(&self, _authorization: &str) -> Result<AuthGrant, AuthError> {
        Ok(AuthGrant {
            namespace: self.namespace.clone(),
        })
    }
}
