//! Error taxonomy shared by every layer of the driver.
//!
//! Each layer owns a narrow error enum; [`Error`] rolls them up so that every
//! public call resolves to a single `Result<T, Error>`. Server-reported
//! failures that callers are expected to handle (duplicate keys, failed
//! commands) come back through the same channel as successes.
use std::io;

use thiserror::Error;

use crate::{config::ConfigError, protocol::CodecError};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Transport-level failures. Never retried by the layer that raises them.
#[derive(Debug, Error)]
pub enum InterfaceError {
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("connection is closed")]
    Closed,

    #[error("connection lost: {0}")]
    ConnectionLost(String),
}

/// Protocol and lifecycle failures.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database is not initialized")]
    NotInitialized,

    #[error("failed to decode reply: {0}")]
    Decode(CodecError),

    #[error("failed to encode operation: {0}")]
    Encode(CodecError),

    #[error("command failed{}: {message}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Command { code: Option<i32>, message: String },

    #[error("query failure: {0}")]
    QueryFailure(String),

    #[error("cursor {0} not found")]
    CursorNotFound(i64),

    #[error("server sent an empty reply")]
    EmptyReply,

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Interface(#[from] InterfaceError),

    /// A write conflict reported by an acknowledged write's status check.
    #[error("integrity error{}: {message}", .code.map(|c| format!(" ({c})")).unwrap_or_default())]
    Integrity { code: Option<i32>, message: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// Socket faults are handed back untouched.
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    pub fn is_interface(&self) -> bool {
        matches!(self, Error::Interface(_))
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Error::Integrity { .. })
    }

    /// Server error code, when the server attached one.
    pub fn code(&self) -> Option<i32> {
        match self {
            Error::Integrity { code, .. } => *code,
            Error::Database(DatabaseError::Command { code, .. }) => *code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_error_message_carries_code() {
        let err = Error::Integrity {
            code: Some(11000),
            message: "E11000 duplicate key".to_string(),
        };

        assert_eq!(err.to_string(), "integrity error (11000): E11000 duplicate key");
        assert_eq!(err.code(), Some(11000));
        assert!(err.is_integrity());
    }

    #[test]
    fn closed_interface_error_message() {
        let err: Error = InterfaceError::Closed.into();

        assert!(err.is_interface());
        assert_eq!(err.to_string(), "connection is closed");
    }

    #[test]
    fn command_error_without_code() {
        let err: Error = DatabaseError::Command {
            code: None,
            message: "bad".to_string(),
        }
        .into();

        assert_eq!(err.to_string(), "command failed: bad");
    }
}
