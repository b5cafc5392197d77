//! Error taxonomy for invariant checks
//!
//! Transport and decode failures abort the current check. Mismatches between
//! the ledger and the chain are never errors; they are returned as findings.

use thiserror::Error;

/// Result type used throughout the library.
pub type Result<T> = std::result::Result<T, CheckError>;

/// Errors that abort a check.
#[derive(Debug, Error)]
pub enum CheckError {
    /// Request could not be sent or the body could not be read.
    #[error("{service} request failed: {message}")]
    Transport {
        /// Which collaborator was being called (ledger, chain, estimator)
        service: &'static str,
        message: String,
    },

    /// Non-success HTTP status.
    #[error("{service} returned bad http status: {status}")]
    HttpStatus { service: &'static str, status: u16 },

    /// Malformed response payload.
    #[error("failed to decode {what}: {message}")]
    Decode { what: String, message: String },

    /// JSON-RPC error object returned by the chain node or estimator.
    #[error("rpc error from {method}: {message}")]
    Rpc { method: String, message: String },

    /// The next produced tipset could not be resolved.
    #[error("chain unavailable: {0}")]
    ChainUnavailable(String),

    /// The ledger has no account with this id.
    #[error("agent {0} not found in ledger")]
    AccountNotFound(u64),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// A background estimate observed cancellation before finishing.
    #[error("estimate cancelled")]
    Cancelled,

    /// A background estimate task exited without reporting.
    #[error("{0} estimate task ended without a result")]
    TaskEnded(&'static str),
}

impl CheckError {
    pub(crate) fn transport(service: &'static str, err: impl std::fmt::Display) -> Self {
        CheckError::Transport {
            service,
            message: err.to_string(),
        }
    }

    pub(crate) fn decode(what: impl Into<String>, err: impl std::fmt::Display) -> Self {
        CheckError::Decode {
            what: what.into(),
            message: err.to_string(),
        }
    }
}
