//! Error types shared by the collaborators of the reconciliation loop.

use thiserror::Error;

/// Errors raised by the external collaborators (container runtime, cache
/// store, DNS tools, webhook).  None of them is fatal to the daemon.
#[derive(Debug, Error)]
pub enum Error {
    /// Container runtime API error
    #[error("container runtime error: {0}")]
    Runtime(#[from] bollard::errors::Error),

    /// Cache store error
    #[error("cache store error: {0}")]
    Cache(#[from] redis::RedisError),

    /// Webhook transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Resolver lookup error
    #[error("resolver error: {0}")]
    Resolve(#[from] hickory_resolver::error::ResolveError),

    /// The update tool rejected the transaction
    #[error("update failed: {0}")]
    Update(String),

    /// IO error (subprocess, files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown DNS record type in a statement
    #[error("invalid record type: {0}")]
    RecordType(String),

    /// The collaborator did not answer in time
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A collaborator was configured with unusable settings
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The collaborator is not reachable
    #[error("unavailable: {0}")]
    Unavailable(String),
}

pub type Result<T> = std::result::Result<T, Error>;
