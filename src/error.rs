//! Error types shared by the domain services.

use std::fmt;

use thiserror::Error;

/// Result type alias using the warden `Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// How a hypervisor call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    /// Connection refused, DNS failure, TLS failure, reset.
    Network,
    /// The API answered with an error status or a failed task.
    Api,
    /// The call exceeded its upper bound.
    Timeout,
    /// A command inside a guest exited non-zero.
    Command,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteErrorKind::Network => write!(f, "network"),
            RemoteErrorKind::Api => write!(f, "api"),
            RemoteErrorKind::Timeout => write!(f, "timeout"),
            RemoteErrorKind::Command => write!(f, "command"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    #[error("{kind} already exists: {id}")]
    Duplicate { kind: String, id: String },

    #[error("an operation is already in flight for {target}")]
    InFlight { target: String },

    #[error("hypervisor {kind} error: {message}")]
    Remote {
        kind: RemoteErrorKind,
        message: String,
    },

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &str, id: impl fmt::Display) -> Self {
        Self::NotFound {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn duplicate(kind: &str, id: impl fmt::Display) -> Self {
        Self::Duplicate {
            kind: kind.to_string(),
            id: id.to_string(),
        }
    }

    pub fn remote(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self::Remote {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(what: &str, secs: u64) -> Self {
        Self::remote(
            RemoteErrorKind::Timeout,
            format!("{} did not complete within {}s", what, secs),
        )
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            RemoteErrorKind::Timeout
        } else if e.is_status() || e.is_decode() {
            RemoteErrorKind::Api
        } else {
            RemoteErrorKind::Network
        };
        Error::remote(kind, e.to_string())
    }
}
