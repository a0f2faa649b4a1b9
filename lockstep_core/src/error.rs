//! Error types for the Lockstep kernel and protocol layer.

use crate::entity::EntityError;
use crate::mode::Mode;
use lockstep_env::{EnvError, OffsetError};
use thiserror::Error;

/// Errors raised by [`crate::Simulator`] operations.
///
/// Wrong-mode calls never mutate state; they are logged and surfaced as
/// `IllegalTransition`.
#[derive(Debug, Error)]
pub enum KernelError {
    /// Operation not permitted in the current mode
    #[error("Cannot {operation}: simulator is {mode}")]
    IllegalTransition { operation: &'static str, mode: Mode },

    /// Argument outside its legal range (e.g. non-positive scale factor)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// An entity failed during tick or tock; the run is abandoned
    #[error("Entity failure: {0}")]
    Entity(#[from] EntityError),

    /// The background execution task panicked or was aborted
    #[error("Execution task failed: {0}")]
    ExecutionAborted(String),
}

impl KernelError {
    /// Creates an invalid argument error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }
}

/// A malformed or missing field in an inbound command.
///
/// The whole command is discarded; `field` names the first offending field.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed or missing '{field}': {reason}")]
pub struct ValidationError {
    /// Wire name of the field (e.g. `simStartTime`)
    pub field: String,

    /// Human readable reason
    pub reason: String,
}

impl ValidationError {
    /// Creates a validation error for `field`.
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the application roles (manager / managed application).
#[derive(Debug, Error)]
pub enum ApplicationError {
    /// Inbound or outbound command failed validation
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Kernel rejected the requested transition
    #[error(transparent)]
    Kernel(#[from] KernelError),

    /// Broker transport failed
    #[error(transparent)]
    Transport(#[from] EnvError),

    /// Clock offset could not be established and the policy requires one
    #[error(transparent)]
    ClockSync(#[from] OffsetError),

    /// Configuration could not be loaded or is inconsistent
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation requires `start_up` first
    #[error("Application {0} is not started")]
    NotStarted(String),
}
