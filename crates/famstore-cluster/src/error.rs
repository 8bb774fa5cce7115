//! Error types for the FamStore cluster layer
//!
//! Connection-level failures (`Io`, `ServerUnreachable`) are the only
//! retryable errors. Misses, size violations and server-reported failures are
//! returned to the caller on the first attempt. `Io` and `Protocol` errors
//! leave the byte stream in an unknown state, so the connection is dropped.

use std::error::Error;
use std::fmt;
use std::io;

use famstore_core::{ErrorKind, StoreError};

use crate::config::Location;
use crate::protocol::Status;

/// FamStore client and node errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// No connection could be opened to the owning node
    ServerUnreachable {
        /// Node that owns the key
        location: Location,
        /// Connection attempts made
        attempts: u32,
    },

    /// Key absent on the owning node
    NotFound,

    /// Key exceeds the engine's maximum, rejected before sending
    KeyTooLong {
        len: usize,
        max: usize,
    },

    /// Value exceeds the configured maximum, rejected before sending
    ValueTooLong {
        len: usize,
        max: usize,
    },

    /// Socket failure on an established or opening connection
    Io {
        /// Peer, if known
        location: Option<Location>,
        /// Error kind for programmatic handling
        kind: io::ErrorKind,
        /// Human-readable error message
        message: String,
    },

    /// Malformed frame or unexpected response
    Protocol {
        reason: String,
    },

    /// Node answered with a failure status other than not-found
    Server {
        status: Status,
        message: String,
    },

    /// Cluster configuration missing or invalid
    Config {
        reason: String,
    },
}

impl ClientError {
    /// Whether the failed operation should be retried on a fresh connection.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Io { .. } | ClientError::ServerUnreachable { .. })
    }

    /// Whether the connection that produced this error can no longer be trusted.
    pub fn poisons_connection(&self) -> bool {
        matches!(self, ClientError::Io { .. } | ClientError::Protocol { .. })
    }

    /// Attach the peer to an I/O error.
    pub(crate) fn io_at(location: &Location, err: io::Error) -> Self {
        ClientError::Io {
            location: Some(location.clone()),
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::ServerUnreachable { location, attempts } => {
                write!(f, "Server {} unreachable after {} attempt(s)", location, attempts)
            }

            ClientError::NotFound => write!(f, "Key not found"),

            ClientError::KeyTooLong { len, max } => {
                write!(f, "Key too long: {} bytes exceeds limit of {} bytes", len, max)
            }

            ClientError::ValueTooLong { len, max } => {
                write!(f, "Value too long: {} bytes exceeds limit of {} bytes", len, max)
            }

            ClientError::Io { location, kind, message } => match location {
                Some(loc) => write!(f, "I/O error ({:?}) talking to {}: {}", kind, loc, message),
                None => write!(f, "I/O error ({:?}): {}", kind, message),
            },

            ClientError::Protocol { reason } => write!(f, "Protocol error: {}", reason),

            ClientError::Server { status, message } => {
                write!(f, "Server returned {:?}: {}", status, message)
            }

            ClientError::Config { reason } => write!(f, "Invalid cluster configuration: {}", reason),
        }
    }
}

impl Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(err: io::Error) -> Self {
        ClientError::Io {
            location: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Config { reason: err.to_string() }
    }
}

impl StoreError for ClientError {
    fn kind(&self) -> ErrorKind {
        match self {
            ClientError::NotFound => ErrorKind::NotFound,
            ClientError::KeyTooLong { .. } => ErrorKind::KeyTooLong,
            ClientError::ValueTooLong { .. } => ErrorKind::ValueTooLong,
            ClientError::ServerUnreachable { .. } | ClientError::Io { .. } => ErrorKind::Unavailable,
            ClientError::Server { status, .. } => match status {
                Status::KeyNotFound => ErrorKind::NotFound,
                Status::ValueTooLarge => ErrorKind::ValueTooLong,
                Status::OutOfMemory => ErrorKind::OutOfMemory,
                _ => ErrorKind::Other,
            },
            _ => ErrorKind::Other,
        }
    }
}

/// Result type alias for cluster operations
pub type ClientResult<T> = Result<T, ClientError>;
