//! Managed connection error types.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Capability invocation a deadline applies to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Session factory call
    Create,
    /// Close capability call
    Close,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Create => write!(f, "session creation"),
            Operation::Close => write!(f, "session close"),
        }
    }
}

/// Managed connection errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The session factory completed without producing a session
    #[error("session factory returned no session")]
    NoSession,

    /// The session factory failed
    #[error("failed to create session: {0}")]
    Create(#[source] anyhow::Error),

    /// The close capability failed; the session is still considered open
    #[error("failed to close session: {0}")]
    Close(#[source] anyhow::Error),

    /// A factory or close invocation exceeded its deadline
    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        /// Operation that timed out
        operation: Operation,
        /// Configured deadline
        timeout: Duration,
    },

    /// Connection settings could not be turned into comparable data
    #[error("invalid connection settings: {0}")]
    Settings(#[from] serde_json::Error),
}

impl ConnectionError {
    /// Whether this error happened while creating a session
    pub fn is_creation_failure(&self) -> bool {
        matches!(
            self,
            ConnectionError::NoSession
                | ConnectionError::Create(_)
                | ConnectionError::Timeout {
                    operation: Operation::Create,
                    ..
                }
        )
    }

    /// Whether this error happened while closing a session
    pub fn is_teardown_failure(&self) -> bool {
        matches!(
            self,
            ConnectionError::Close(_)
                | ConnectionError::Timeout {
                    operation: Operation::Close,
                    ..
                }
        )
    }
}
