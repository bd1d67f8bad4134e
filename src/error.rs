/*!
 * Error types for rmem
 */

use rmem_connect::{ConnectError, ProtocolVersion, RemoteError, RemoteErrorKind};
use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, RmemError>;

#[derive(Debug)]
pub enum RmemError {
    /// Connect or reconnect gave up after exhausting its attempts
    Connection(String),

    /// Local and remote protocol versions differ
    VersionMismatch {
        local: ProtocolVersion,
        remote: ProtocolVersion,
    },

    /// Mid-call transport failure that could not be recovered
    Transport(String),

    /// Module or namespace lookup failed on the remote side
    Resolution { module: String, reason: String },

    /// Registry key absent or deleted
    KeyNotFound(String),

    /// Invalid construction arguments
    Configuration(String),

    /// Any other failure raised by the remote endpoint
    Remote(RemoteError),

    /// I/O error
    Io(io::Error),

    /// Configuration file could not be parsed or written
    Config(String),
}

impl RmemError {
    /// Whether this error means there is no usable connection
    ///
    /// After `close()` every operation fails with one of these until the
    /// connection is re-established explicitly.
    pub fn is_connection_class(&self) -> bool {
        matches!(
            self,
            RmemError::Connection(_) | RmemError::VersionMismatch { .. } | RmemError::Transport(_)
        )
    }

    /// Kind of the remote failure, if the endpoint raised one
    pub fn remote_kind(&self) -> Option<RemoteErrorKind> {
        match self {
            RmemError::Remote(e) => Some(e.kind),
            RmemError::KeyNotFound(_) => Some(RemoteErrorKind::KeyNotFound),
            _ => None,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> ErrorCategory {
        match self {
            RmemError::Connection(_) | RmemError::Transport(_) => ErrorCategory::Network,
            RmemError::VersionMismatch { .. } => ErrorCategory::Compatibility,
            RmemError::Resolution { .. } => ErrorCategory::Resolution,
            RmemError::KeyNotFound(_) => ErrorCategory::Registry,
            RmemError::Configuration(_) | RmemError::Config(_) => ErrorCategory::Configuration,
            RmemError::Remote(_) => ErrorCategory::Remote,
            RmemError::Io(_) => ErrorCategory::IoError,
        }
    }
}

/// Error category for classification and reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Connection setup and transport failures
    Network,
    /// Protocol version disagreement
    Compatibility,
    /// Remote module lookup
    Resolution,
    /// Registry key lookups
    Registry,
    /// Configuration errors
    Configuration,
    /// Errors raised by remote objects
    Remote,
    /// Local I/O errors
    IoError,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "network"),
            ErrorCategory::Compatibility => write!(f, "compatibility"),
            ErrorCategory::Resolution => write!(f, "resolution"),
            ErrorCategory::Registry => write!(f, "registry"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Remote => write!(f, "remote"),
            ErrorCategory::IoError => write!(f, "io"),
        }
    }
}

impl fmt::Display for RmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RmemError::Connection(msg) => write!(f, "Connection error: {}", msg),
            RmemError::VersionMismatch { local, remote } => write!(
                f,
                "Remote protocol version [{}] mismatches with the local version [{}]",
                remote, local
            ),
            RmemError::Transport(msg) => write!(f, "Transport error: {}", msg),
            RmemError::Resolution { module, reason } => {
                write!(f, "Unable to resolve remote module '{}': {}", module, reason)
            }
            RmemError::KeyNotFound(msg) => write!(f, "{}", msg),
            RmemError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            RmemError::Remote(err) => write!(f, "Remote error: {}", err),
            RmemError::Io(err) => write!(f, "I/O error: {}", err),
            RmemError::Config(msg) => write!(f, "Configuration file error: {}", msg),
        }
    }
}

impl std::error::Error for RmemError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RmemError::Io(err) => Some(err),
            RmemError::Remote(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RmemError {
    fn from(err: io::Error) -> Self {
        RmemError::Io(err)
    }
}

impl From<RemoteError> for RmemError {
    fn from(err: RemoteError) -> Self {
        match err.kind {
            RemoteErrorKind::KeyNotFound => RmemError::KeyNotFound(err.message),
            _ => RmemError::Remote(err),
        }
    }
}

impl From<ConnectError> for RmemError {
    fn from(err: ConnectError) -> Self {
        match err {
            ConnectError::ConnectionFailed { .. } | ConnectError::Unstable { .. } => {
                RmemError::Connection(err.to_string())
            }
            ConnectError::VersionMismatch { local, remote } => {
                RmemError::VersionMismatch { local, remote }
            }
            ConnectError::Transport(reason) => RmemError::Transport(reason),
            ConnectError::Remote(remote) => remote.into(),
        }
    }
}

impl From<toml::de::Error> for RmemError {
    fn from(err: toml::de::Error) -> Self {
        RmemError::Config(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for RmemError {
    fn from(err: toml::ser::Error) -> Self {
        RmemError::Config(format!("TOML serialization error: {}", err))
    }
}
