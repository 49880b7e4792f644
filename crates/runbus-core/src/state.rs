//! Worker state machine.
//!
//! Legal controller-driven transitions:
//!
//! | From | To | Meaning |
//! |---|---|---|
//! | RUNNING | PAUSED | pause, optionally deferred to the next checkpoint |
//! | PAUSED | RUNNING | resume |
//! | RUNNING, PAUSED | ABORTING | cancel, in-flight work fails |
//! | RUNNING, PAUSED | STOPPING | cancel, in-flight work succeeds |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// State of the worker's execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerState {
    /// Waiting for a task
    Idle,
    /// Executing a task
    Running,
    /// Pause requested, waiting for the next checkpoint
    Pausing,
    /// Paused at a checkpoint
    Paused,
    /// Halting without cleanup
    Halting,
    /// Cancelling, in-flight work will be marked successful
    Stopping,
    /// Cancelling, in-flight work will be marked failed
    Aborting,
    /// Suspended by an external condition
    Suspending,
    /// The engine hit an unrecoverable error
    Panicked,
    /// State could not be determined
    Unknown,
}

impl WorkerState {
    /// States a task can finish in.
    ///
    /// A task-complete event carries one of these: the engine returns to
    /// `Idle` after a normal finish, an abort or a stop, and lands in
    /// `Panicked` when it fails outright.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Idle | Self::Panicked)
    }

    /// Check that the controller may move the worker from `self` to `target`.
    pub fn check_transition(self, target: WorkerState) -> Result<()> {
        let allowed = match (self, target) {
            (Self::Running, Self::Paused) => true,
            (Self::Paused, Self::Running) => true,
            (Self::Running | Self::Paused, Self::Aborting | Self::Stopping) => true,
            _ => false,
        };
        if allowed {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                from: self,
                to: target,
            })
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "IDLE",
            Self::Running => "RUNNING",
            Self::Pausing => "PAUSING",
            Self::Paused => "PAUSED",
            Self::Halting => "HALTING",
            Self::Stopping => "STOPPING",
            Self::Aborting => "ABORTING",
            Self::Suspending => "SUSPENDING",
            Self::Panicked => "PANICKED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// Controller request to change the worker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangeRequest {
    /// Requested state
    pub new_state: WorkerState,
    /// Pause at the next checkpoint instead of immediately
    #[serde(default)]
    pub defer: bool,
    /// Reason recorded when aborting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl StateChangeRequest {
    /// Plain request for `new_state`.
    #[must_use]
    pub fn new(new_state: WorkerState) -> Self {
        Self {
            new_state,
            defer: false,
            reason: None,
        }
    }

    /// Defer a pause to the next checkpoint.
    #[must_use]
    pub fn deferred(mut self, defer: bool) -> Self {
        self.defer = defer;
        self
    }

    /// Attach a reason.
    #[must_use]
    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }

    /// Resolve the request against the current state into the action the
    /// worker has to perform.
    pub fn action(&self, current: WorkerState) -> Result<StateAction> {
        current.check_transition(self.new_state)?;
        Ok(match self.new_state {
            WorkerState::Paused => StateAction::Pause { defer: self.defer },
            WorkerState::Running => StateAction::Resume,
            WorkerState::Aborting => StateAction::Cancel {
                failure: true,
                reason: self.reason.clone(),
            },
            WorkerState::Stopping => StateAction::Cancel {
                failure: false,
                reason: self.reason.clone(),
            },
            // check_transition admits no other targets
            other => {
                return Err(Error::InvalidTransition {
                    from: current,
                    to: other,
                })
            }
        })
    }
}

/// Worker-side action derived from a legal state change request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateAction {
    /// Pause the active task
    Pause {
        /// Wait for the next checkpoint
        defer: bool,
    },
    /// Resume a paused task
    Resume,
    /// Cancel the active task
    Cancel {
        /// Mark the task failed (abort) rather than successful (stop)
        failure: bool,
        /// Reason to record
        reason: Option<String>,
    },
}
