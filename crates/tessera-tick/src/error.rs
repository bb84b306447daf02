//! Error types for scheduling and procedure execution.

use tessera_ecs::{AccessConflict, EcsError};
use thiserror::Error;

/// Result type for scheduler operations.
pub type TickResult<T> = Result<T, TickError>;

/// Errors raised while wiring or running procedures.
#[derive(Debug, Error)]
pub enum TickError {
    /// A storage, relation or resource operation failed.
    #[error(transparent)]
    Ecs(#[from] EcsError),

    #[error("no schedule is installed in this world")]
    SchedulerNotFound,

    #[error("state {0} is not registered")]
    StateNotRegistered(&'static str),

    /// A procedure's own parameters would alias each other mutably.
    #[error("procedure {procedure} conflicts with itself on {conflict}")]
    ConflictingAccess {
        procedure: &'static str,
        conflict: AccessConflict,
    },

    #[error("argument {0} was not supplied to this run")]
    ArgumentMissing(&'static str),

    #[error("procedure {0} ran before it was initialized")]
    Uninitialized(&'static str),

    #[error("state {state} kept transitioning after {limit} transitions")]
    TransitionLoop { state: &'static str, limit: u32 },

    /// Failure reported by user code.
    #[error("{0}")]
    Procedure(String),
}

impl TickError {
    /// Wrap a free-form failure raised inside a procedure.
    pub fn procedure(message: impl Into<String>) -> Self {
        Self::Procedure(message.into())
    }
}
