//! Error types for the rmem-connect crate

use crate::protocol::ProtocolVersion;
use rmem_core_resilience::Retryable;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Kind of failure raised inside the remote endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// No object is mapped to the requested registry key
    KeyNotFound,
    /// A module could not be imported on the remote side
    Import,
    /// Attribute lookup failed
    Attribute,
    /// Operation not supported for the operand types
    Type,
    /// Sequence index out of range
    Index,
    /// Mapping key missing
    Key,
    /// Right type, wrong value
    Value,
    /// Division or modulo by zero
    ZeroDivision,
    /// Anything else
    Runtime,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::KeyNotFound => write!(f, "key-not-found"),
            RemoteErrorKind::Import => write!(f, "import"),
            RemoteErrorKind::Attribute => write!(f, "attribute"),
            RemoteErrorKind::Type => write!(f, "type"),
            RemoteErrorKind::Index => write!(f, "index"),
            RemoteErrorKind::Key => write!(f, "key"),
            RemoteErrorKind::Value => write!(f, "value"),
            RemoteErrorKind::ZeroDivision => write!(f, "zero-division"),
            RemoteErrorKind::Runtime => write!(f, "runtime"),
        }
    }
}

/// An error raised by the remote endpoint and shipped back to the caller
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind} error: {message}")]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub message: String,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn key_not_found(key: &str) -> Self {
        Self::new(
            RemoteErrorKind::KeyNotFound,
            format!("No remote object exists against the key '{}'", key),
        )
    }
}

/// Failure reported by a [`crate::RemoteChannel`]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ChannelError {
    /// The channel is closed or the underlying I/O failed
    #[error("transport failure: {0}")]
    Transport(String),

    /// The call reached the endpoint and failed there
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl ChannelError {
    pub fn transport(reason: impl Into<String>) -> Self {
        ChannelError::Transport(reason.into())
    }

    /// Check if this error came from the transport rather than the endpoint
    pub fn is_transport(&self) -> bool {
        matches!(self, ChannelError::Transport(_))
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Transport(err.to_string())
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConnectError {
    #[error("Unable to connect to {host}:{port} after {attempts} attempts: {reason}")]
    ConnectionFailed {
        host: String,
        port: u16,
        attempts: u32,
        reason: String,
    },

    #[error("Connection to {host}:{port} failed right after it was established: {reason}")]
    Unstable {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("Remote protocol version [{remote}] mismatches with the local version [{local}]")]
    VersionMismatch {
        local: ProtocolVersion,
        remote: ProtocolVersion,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl ConnectError {
    /// Check if this error means no usable connection could be set up
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            ConnectError::ConnectionFailed { .. } | ConnectError::Unstable { .. }
        )
    }

    /// Check if this error is a mid-call transport failure
    pub fn is_transport(&self) -> bool {
        matches!(self, ConnectError::Transport(_))
    }
}

impl From<ChannelError> for ConnectError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Transport(reason) => ConnectError::Transport(reason),
            ChannelError::Remote(remote) => ConnectError::Remote(remote),
        }
    }
}

impl Retryable for ConnectError {
    fn is_retryable(&self) -> bool {
        // A version mismatch will not resolve itself by retrying
        matches!(
            self,
            ConnectError::Transport(_)
                | ConnectError::ConnectionFailed { .. }
                | ConnectError::Unstable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_error_conversion() {
        let err: ConnectError = ChannelError::transport("socket closed").into();
        assert!(err.is_transport());

        let err: ConnectError = ChannelError::Remote(RemoteError::key_not_found("k1")).into();
        match err {
            ConnectError::Remote(remote) => assert_eq!(remote.kind, RemoteErrorKind::KeyNotFound),
            other => panic!("Expected Remote, got {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_not_retryable() {
        let err = ConnectError::VersionMismatch {
            local: ProtocolVersion::new(1, 0, 0),
            remote: ProtocolVersion::new(2, 0, 0),
        };
        assert!(!err.is_retryable());
        assert!(ConnectError::Transport("refused".to_string()).is_retryable());
        assert!(!ConnectError::Remote(RemoteError::key_not_found("k")).is_retryable());
    }

    #[test]
    fn test_io_error_is_transport() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(ChannelError::from(io).is_transport());
    }

    #[test]
    fn test_display() {
        let err = ConnectError::VersionMismatch {
            local: ProtocolVersion::new(1, 0, 0),
            remote: ProtocolVersion::new(1, 2, 0),
        };
        assert_eq!(
            err.to_string(),
            "Remote protocol version [1.2.0] mismatches with the local version [1.0.0]"
        );
        assert_eq!(
            RemoteError::key_not_found("k1").to_string(),
            "key-not-found error: No remote object exists against the key 'k1'"
        );
    }
}
