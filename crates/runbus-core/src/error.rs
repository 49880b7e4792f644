//! Error types for runbus-core
//!
//! This module provides the error taxonomy shared by the worker, the bus
//! and the controller, plus user-facing formatting for the CLI.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::WorkerState;
use crate::task::TaskId;

/// Core error type
#[derive(Debug, Error)]
pub enum Error {
    /// Task parameters are malformed or the plan does not exist
    #[error("validation error: {0}")]
    Validation(String),

    /// The worker rejected the request or failed while handling it
    #[error("remote error: {0}")]
    Remote(String),

    /// The transport could not be reached
    #[error("connection error: {0}")]
    Connection(String),

    /// An operation that needs a live connection was attempted without one
    #[error("not connected to the message bus")]
    NotConnected,

    /// A peer sent a request that breaks the messaging contract
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// The requested worker state change is not allowed from the current state
    #[error("cannot transition from {from} to {to}")]
    InvalidTransition {
        /// State the worker was in
        from: WorkerState,
        /// State that was requested
        to: WorkerState,
    },

    /// No pending or active task with this id
    #[error("unknown task: {0}")]
    UnknownTask(TaskId),

    /// The controller session already tracks an unfinished task
    #[error("task {0} is already being tracked")]
    TaskAlreadyTracked(TaskId),

    /// Payload could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error (channel closed, task join failure, etc.)
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error classification used by the presentation layer and
/// carried across the bus in error replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Malformed task (local, early)
    Validation,
    /// Worker rejected or errored
    Remote,
    /// Transport unreachable
    Connection,
    /// Malformed request from a non-conforming peer
    ContractViolation,
    /// Anything else
    Internal,
}

impl Error {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_) => ErrorKind::Validation,
            Error::Remote(_)
            | Error::InvalidTransition { .. }
            | Error::UnknownTask(_)
            | Error::TaskAlreadyTracked(_) => ErrorKind::Remote,
            Error::Connection(_) | Error::NotConnected => ErrorKind::Connection,
            Error::ContractViolation(_) => ErrorKind::ContractViolation,
            Error::Serialization(_) | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Rebuild an error received from a remote peer.
    ///
    /// Validation failures keep their kind so the controller can tell a
    /// rejected parameter set from a worker fault. Everything else the
    /// worker reports is a remote error on this side.
    #[must_use]
    pub fn from_remote(kind: ErrorKind, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            ErrorKind::Validation => Error::Validation(message),
            _ => Error::Remote(message),
        }
    }
}

/// Trait for user-friendly error messages
pub trait UserFriendlyError {
    /// Get a user-friendly error message
    fn user_message(&self) -> String;

    /// Get a suggestion for how to fix the error
    fn suggestion(&self) -> Option<String>;
}

impl UserFriendlyError for Error {
    fn user_message(&self) -> String {
        match self {
            Error::Validation(msg) => {
                format!("Failed to validate the task parameters: {}", msg)
            }
            Error::Remote(msg) => format!("Server error with this message: {}", msg),
            Error::Connection(_) | Error::NotConnected => {
                "Failed to establish connection to the message bus.".to_string()
            }
            Error::ContractViolation(msg) => format!("Malformed request: {}", msg),
            Error::InvalidTransition { from, to } => {
                format!("Worker cannot go from {} to {}.", from, to)
            }
            Error::UnknownTask(id) => format!("Task {} is not known to the worker.", id),
            Error::TaskAlreadyTracked(id) => {
                format!("Task {} is still being tracked by this session.", id)
            }
            Error::Serialization(_) => "Received a message that could not be decoded.".to_string(),
            Error::Internal(msg) => format!("Internal error: {}", msg),
        }
    }

    fn suggestion(&self) -> Option<String> {
        match self {
            Error::Connection(_) | Error::NotConnected => Some(
                "Check that the broker is running and that broker.url points at it.".to_string(),
            ),
            Error::Validation(_) => {
                Some("Run `runbus controller plans` to see the expected parameters.".to_string())
            }
            Error::InvalidTransition { .. } => {
                Some("Run `runbus controller state` to see what the worker is doing.".to_string())
            }
            _ => None,
        }
    }
}

/// Format an error for display in the CLI
pub fn format_error_for_cli(error: &Error) -> String {
    let mut output = error.user_message();

    if let Some(suggestion) = error.suggestion() {
        output.push('\n');
        output.push_str(&suggestion);
    }

    output
}
