//! HTTP server module
//!
//! Binds the listener, wires the session controller to the protocol
//! adapter, and serves connections until interrupted.

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::auth::{HttpIdentityProvider, IdentityProvider, StaticIdentityProvider};
use crate::config::Config;
use crate::protocol::ProtocolAdapter;
use crate::session::{MemoryLedger, SessionController};
use crate::storage::s3::S3Backend;

/// Server errors
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(String),

    #[error("Server error: {0}")]
    RuntimeError(String),
}

/// HTTP Server
pub struct Server {
    config: Config,
    addr: SocketAddr,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let addr: SocketAddr = config
            .server
            .address
            .parse()
            .map_err(|e| ServerError::BindError(format!("{}", e)))?;

        Ok(Self { config, addr })
    }

    /// Run the server until ctrl-c
    pub async fn run(&self) -> Result<(), ServerError> {
        let adapter = self.build_adapter().await;

        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| ServerError::BindError(e.to_string()))?;
        let local = listener
            .local_addr()
            .map_err(|e| ServerError::RuntimeError(e.to_string()))?;
        info!("Listening on {}", local);

        tokio::select! {
            result = serve(adapter, listener) => result,
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down server");
                Ok(())
            }
        }
    }

    async fn build_adapter(&self) -> Arc<ProtocolAdapter> {
        let storage = Arc::new(S3Backend::from_config(&self.config.store).await);
        let ledger = Arc::new(MemoryLedger::new());
        let controller = Arc::new(SessionController::new(
            ledger,
            storage,
            self.config.store.effective_part_size(),
        ));

        let identity: Arc<dyn IdentityProvider> = match (self.config.auth.enabled, &self.config.auth.url) {
            (true, Some(url)) => {
                info!(url = %url, "Authorization enabled");
                Arc::new(HttpIdentityProvider::new(url.clone()))
            }
            _ => Arc::new(StaticIdentityProvider::new(self.config.store.bucket.clone())),
        };

        Arc::new(ProtocolAdapter::new(
            controller,
            identity,
            self.config.server.upload_path.clone(),
            self.config.server.max_size,
            self.config.auth.enabled,
            self.config.metrics.enabled,
        ))
    }
}

/// Accept loop; one task per connection.
pub async fn serve(adapter: Arc<ProtocolAdapter>, listener: TcpListener) -> Result<(), ServerError> {
    loop {
        let (stream, remote) = listener
            .accept()
            .await
            .map_err(|e| ServerError::RuntimeError(e.to_string()))?;
        let io = TokioIo::new(stream);
        let adapter = adapter.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| {
                let adapter = adapter.clone();
                async move { Ok::<_, std::convert::Infallible>(adapter.handle(req).await) }
            });

            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                error!(remote = %remote, error = %err, "connection error");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthConfig, MetricsConfig, ServerConfig, StoreConfig};

    fn test_config() -> Config {
        Config {
            server: ServerConfig {
                address: "127.0.0.1:0".into(),
                upload_path: "/files".into(),
                max_size: 0,
            },
            store: StoreConfig {
                bucket: "userdata".into(),
                region: "us-east-1".into(),
                endpoint: None,
                access_key: None,
                secret_key: None,
                part_size: 8 * 1024 * 1024,
            },
            auth: AuthConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    #[test]
    fn test_server_new() {
        let server = Server::new(test_config());
        assert!(server.is_ok());
    }

    #[test]
    fn test_server_invalid_address() {
        let mut config = test_config();
        config.server.address = "invalid".into();
        let server = Server::new(config);
        assert!(server.is_err());
    }
}
