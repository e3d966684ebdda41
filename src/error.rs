use std::io;

use thiserror::Error;

/// Crate-wide error kinds, mirroring the failure semantics of the data plane:
/// config errors are fatal at startup, resource exhaustion aborts a single
/// worker without taking down the process, OS provisioning failures are
/// fatal to the affected worker, peer errors just tear a tunnel down, and
/// `Shutdown` is the cooperative-cancellation signal workers observe at
/// their poll points.
#[derive(Debug, Error)]
pub enum ConcentratorError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    #[error("OS provisioning failed: {0}")]
    OsProvisioning(String),

    #[error("peer error: {0}")]
    Peer(String),

    #[error("shutting down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("tls error: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),
}

pub type Result<T> = std::result::Result<T, ConcentratorError>;
