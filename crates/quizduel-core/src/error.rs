//! Engine error handling
//!
//! Provides typed errors for connection, protocol and local action failures
//! with a retry classification used by the connection manager.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while driving a duel session
#[derive(Error, Debug)]
pub enum DuelError {
    /// The transport is down and the action needs it
    #[error("Not connected to the duel server")]
    NotConnected,

    /// No auth token could be found in credential storage
    #[error("No auth token found. Run `quizduel login` first.")]
    MissingToken,

    /// The connection attempt did not complete in time
    #[error("Connection timed out after {}s", .0.as_secs())]
    ConnectTimeout(Duration),

    /// The underlying socket failed
    #[error("Transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Credential storage could not be read or written
    #[error("Credential storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// An in-flight attempt was abandoned because its session was torn down
    #[error("Connection attempt cancelled")]
    Cancelled,

    /// The engine task is no longer running
    #[error("Duel engine has stopped")]
    EngineStopped,

    /// The REST collaborator failed
    #[error("API error: {0}")]
    Api(String),
}

impl DuelError {
    /// Whether the connection manager should schedule another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, DuelError::ConnectTimeout(_) | DuelError::Transport(_))
    }
}

// Shared in-flight attempts hand the same failure to every waiter
impl Clone for DuelError {
    fn clone(&self) -> Self {
        match self {
            DuelError::NotConnected => DuelError::NotConnected,
            DuelError::MissingToken => DuelError::MissingToken,
            DuelError::ConnectTimeout(after) => DuelError::ConnectTimeout(*after),
            DuelError::Transport(msg) => DuelError::Transport(msg.clone()),
            DuelError::Protocol(msg) => DuelError::Protocol(msg.clone()),
            DuelError::Storage { path, source } => DuelError::Storage {
                path: path.clone(),
                source: io::Error::new(source.kind(), source.to_string()),
            },
            DuelError::Cancelled => DuelError::Cancelled,
            DuelError::EngineStopped => DuelError::EngineStopped,
            DuelError::Api(msg) => DuelError::Api(msg.clone()),
        }
    }
}

impl From<serde_json::Error> for DuelError {
    fn from(err: serde_json::Error) -> Self {
        DuelError::Protocol(err.to_string())
    }
}

impl From<reqwest::Error> for DuelError {
    fn from(err: reqwest::Error) -> Self {
        DuelError::Api(err.to_string())
    }
}

/// Result type for engine operations
pub type DuelResult<T> = Result<T, DuelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(DuelError::ConnectTimeout(Duration::from_secs(15)).is_retryable());
        assert!(DuelError::Transport("reset by peer".into()).is_retryable());
        assert!(!DuelError::MissingToken.is_retryable());
        assert!(!DuelError::Cancelled.is_retryable());
    }

    #[test]
    fn test_timeout_display() {
        let err = DuelError::ConnectTimeout(Duration::from_secs(15));
        assert_eq!(err.to_string(), "Connection timed out after 15s");
    }

    #[test]
    fn test_storage_display() {
        let err = DuelError::Storage {
            path: PathBuf::from("/data/credentials.json"),
            source: io::Error::new(io::ErrorKind::PermissionDenied, "denied"),
        };

        let msg = err.to_string();
        assert!(msg.contains("credentials.json"));
        assert!(msg.contains("denied"));
    }

    #[test]
    fn test_clone_keeps_storage_detail() {
        let err = DuelError::Storage {
            path: PathBuf::from("/data/credentials.json"),
            source: io::Error::new(io::ErrorKind::NotFound, "missing"),
        };

        assert_eq!(err.clone().to_string(), err.to_string());
    }

    #[test]
    fn test_protocol_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: DuelError = json_err.into();
        assert!(matches!(err, DuelError::Protocol(_)));
    }
}
