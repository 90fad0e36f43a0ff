//! Error types for the collaboration layer.
//!
//! Each failure class is contained where it happens: decode failures are
//! logged and dropped, connection failures feed the reconnect loop,
//! persistence and permission failures surface to the caller without
//! touching the store. [`SessionError`] wraps them for session-level calls.

use std::path::PathBuf;

use inkpad_core::{DecodeError, EditError, Role};
use thiserror::Error;

/// Wire frame encoding failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("frame serialization failed: {0}")]
    Serialization(String),
    #[error("frame deserialization failed: {0}")]
    Deserialization(String),
}

/// Transport failure on the collaboration link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("invalid collaboration url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("connecting to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("link lost: {0}")]
    LinkLost(String),
    #[error("gave up after {0} reconnect attempts")]
    RetriesExhausted(u32),
    #[error("sync channel is closed")]
    Closed,
}

/// Collaborator API call failed. The store is never touched on this path.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// The participant's role does not allow the attempted action.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{role} participants cannot {action}")]
pub struct PermissionError {
    pub role: Role,
    pub action: &'static str,
}

/// Client or relay configuration could not be loaded.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("{field} must be a {expected} url, got {value:?}")]
    InvalidUrl {
        field: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Anything a document session operation can fail with.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Edit(#[from] EditError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Permission(#[from] PermissionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_error_message() {
        let err = PermissionError {
            role: Role::Viewer,
            action: "edit this document",
        };
        assert_eq!(err.to_string(), "viewer participants cannot edit this document");
    }

    #[test]
    fn test_session_error_from() {
        let err: SessionError = DecodeError::Malformed("eof".into()).into();
        assert!(matches!(err, SessionError::Decode(_)));
        assert_eq!(err.to_string(), "malformed update: eof");
    }
}
