//! Error types for pullsub.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;

/// Result type for pullsub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pullsub.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Validation error.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Error reported by the Pub/Sub service for an RPC.
    #[error("RPC failed with {code:?}: {message}")]
    Rpc {
        /// Status code returned by the service.
        code: tonic::Code,
        /// Status message returned by the service.
        message: String,
        /// Per ack id error reasons, when the service attached them.
        metadata: HashMap<String, String>,
    },

    /// Local or transport level failure that never reached the service.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Operation not permitted in the current lifecycle state.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// The subscriber (or one of its connections) failed.
    #[error("Subscriber failed: {0}")]
    SubscriberFailed(Arc<Error>),

    /// The subscriber is shutting down.
    #[error("Subscriber is shutting down")]
    Shutdown,

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration file parse error.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a service error with the given code and message.
    pub fn rpc(code: tonic::Code, message: impl Into<String>) -> Self {
        Error::Rpc {
            code,
            message: message.into(),
            metadata: HashMap::new(),
        }
    }

    /// Build a service error carrying per ack id failure reasons.
    pub fn rpc_with_metadata(
        code: tonic::Code,
        message: impl Into<String>,
        metadata: HashMap<String, String>,
    ) -> Self {
        Error::Rpc {
            code,
            message: message.into(),
            metadata,
        }
    }

    /// Service status code, if this error came from the service.
    pub fn code(&self) -> Option<tonic::Code> {
        match self {
            Error::Rpc { code, .. } => Some(*code),
            Error::SubscriberFailed(inner) => inner.code(),
            _ => None,
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::rpc(status.code(), status.message())
    }
}

/// Validation error types.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// Invalid subscription name.
    #[error("Invalid subscription name: {0}")]
    InvalidSubscriptionName(String),

    /// Invalid duration setting.
    #[error("Invalid duration {name}: {reason}")]
    InvalidDuration {
        /// Setting name.
        name: String,
        /// Reason for invalidity.
        reason: String,
    },

    /// Invalid parameter.
    #[error("Invalid parameter {name}: {reason}")]
    InvalidParameter {
        /// Parameter name.
        name: String,
        /// Reason for invalidity.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_conversion_keeps_code_and_message() {
        let err: Error = tonic::Status::permission_denied("no access").into();
        assert_eq!(err.code(), Some(tonic::Code::PermissionDenied));
        assert!(err.to_string().contains("no access"));
    }

    #[test]
    fn test_local_errors_have_no_code() {
        assert_eq!(Error::Transport("reset".to_string()).code(), None);
        assert_eq!(Error::Shutdown.code(), None);
    }

    #[test]
    fn test_subscriber_failed_exposes_inner_code() {
        let inner = Arc::new(Error::rpc(tonic::Code::NotFound, "gone"));
        let err = Error::SubscriberFailed(inner);
        assert_eq!(err.code(), Some(tonic::Code::NotFound));
    }
}
