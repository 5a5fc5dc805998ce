//! Error handling types for finx-socket
//!
//! Every fallible operation in the crate returns [`ClientResult`]. Remote
//! errors reported by the service for a request are *values*
//! ([`crate::cache::Resolved::RemoteError`]) and never surface here.

use std::sync::PoisonError;
use thiserror::Error;

/// Comprehensive error type for client operations
#[derive(Debug, Error)]
pub enum ClientError {
    /// The service did not acknowledge the API key in time
    #[error("Client not authenticated: {message}")]
    Authentication { message: String },

    /// The socket could not be opened or failed while open
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// The connection closed while the request was outstanding
    #[error("Connection closed before a result arrived")]
    ConnectionClosed,

    /// A frame was submitted before the session authenticated
    #[error("Session is not authenticated")]
    NotAuthenticated,

    /// The request payload could not be encoded
    #[error("Failed to serialize payload: {message}")]
    Serialization { message: String },

    /// A result arrived but could not be matched to its request
    #[error("Failed to find result for {fingerprint}: {message}")]
    Correlation { fingerprint: String, message: String },

    /// The method cannot be used the way it was called
    #[error("Invalid batch usage: {message}")]
    BatchUsage { message: String },

    /// The method is not in the loaded function table
    #[error("Unknown API method: {name}")]
    UnknownMethod { name: String },

    /// A required parameter was not supplied
    #[error("Missing required parameter '{parameter}' for {method}")]
    MissingParameter { method: String, parameter: String },

    /// Configuration error
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// Upload or download through the HTTP side channel failed
    #[error("Side channel error: {message}")]
    SideChannel { message: String },

    /// The per-dispatch deadline expired
    #[error("Timed out waiting for {fingerprint}")]
    Timeout { fingerprint: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// CSV encoding or decoding error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Helper trait to recover from poisoned locks
pub trait LockResultExt<T> {
    /// Recover the guard from a poisoned lock, logging which operation hit it.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "finx_socket::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}

/// Helper functions for common error patterns
impl ClientError {
    /// Create an authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        ClientError::Authentication {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        ClientError::Connection {
            message: message.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        ClientError::Serialization {
            message: message.into(),
        }
    }

    /// Create a correlation error scoped to one fingerprint
    pub fn correlation(fingerprint: impl ToString, message: impl Into<String>) -> Self {
        ClientError::Correlation {
            fingerprint: fingerprint.to_string(),
            message: message.into(),
        }
    }

    /// Create a batch usage error
    pub fn batch_usage(message: impl Into<String>) -> Self {
        ClientError::BatchUsage {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        ClientError::Config {
            message: message.into(),
        }
    }

    /// Create a side channel error
    pub fn side_channel(message: impl Into<String>) -> Self {
        ClientError::SideChannel {
            message: message.into(),
        }
    }

    /// Create a timeout error for one fingerprint
    pub fn timeout(fingerprint: impl ToString) -> Self {
        ClientError::Timeout {
            fingerprint: fingerprint.to_string(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        ClientError::Internal(message.into())
    }
}
