//! Error types for the tidelog client.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

use crate::types::Value;

/// Result type alias for tidelog operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tidelog client.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Wire protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Network errors
    #[error("Network error: {0}")]
    Network(String),

    /// Server-reported RPC failure
    #[error("RPC error {code}: {message}")]
    Rpc {
        code: String,
        message: String,
        params: HashMap<String, Value>,
    },

    /// Call timed out waiting for a response
    #[error("RPC timeout: {0}")]
    Timeout(String),

    /// Connection closed while a call was outstanding
    #[error("Call interrupted: {0}")]
    Interrupted(String),

    /// Login rejected by the server
    #[error("Login failure: {0}")]
    LoginFailure(String),

    /// Unknown query id
    #[error("Query not found: {0}")]
    QueryNotFound(i64),

    /// Query reached the Cancelled state while a caller was waiting on it
    #[error("Query {id} cancelled: {reason}")]
    QueryCancelled { id: i64, reason: String },

    /// Invalid input errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation attempted on a closed client
    #[error("Client is closed")]
    Closed,

    /// Batch insert failure delivered through an insert handle
    #[error("Batch insert failed: {0}")]
    Insert(Arc<Error>),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Other errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl Error {
    /// Server error code, when this is a server-reported RPC failure.
    pub fn rpc_code(&self) -> Option<&str> {
        match self {
            Error::Rpc { code, .. } => Some(code),
            _ => None,
        }
    }
}
