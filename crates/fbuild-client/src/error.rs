//! Client error types.

use thiserror::Error;

/// Errors surfaced by the daemon client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport failure.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    /// The daemon answered something the client cannot interpret.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The daemon rejected the CONNECT exchange.
    #[error("connection rejected: {0}")]
    Rejected(String),

    /// No response arrived within the request timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection is gone.
    #[error("connection closed")]
    Closed,
}
