//! Tus Uploadr Library
//!
//! Resumable chunked upload server speaking the tus 1.0.0 protocol over
//! S3 multipart storage.
//!
//! # Features
//!
//! - **Resumable Uploads**: tus creation, creation-defer-length and
//!   termination extensions
//! - **Multipart Assembly**: client chunks of any size repacked into
//!   storage parts
//! - **Crash-Safe Resumption**: HEAD reports the durable offset, clients
//!   continue from there
//! - **Pluggable Identity**: session creation authorized against an
//!   external identity service
//!
//! # Example
//!
//! ```no_run
//! use tus_uploadr::{config::Config, server::Server};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let server = Server::new(config)?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod config;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;

// Re-export commonly used types
pub use config::Config;
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
