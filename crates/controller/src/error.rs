//! Error types for the machine controller.

use machina_workflow::EngineError;
use thiserror::Error;

/// Errors surfaced by the machine controller.
#[derive(Error, Debug)]
pub enum MachineError {
    /// Command rejected by the state machine preconditions
    #[error("Cannot {command}: {reason}")]
    Preconditions { command: String, reason: String },

    /// Underlying engine error
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type alias using MachineError.
pub type MachineResult<T> = Result<T, MachineError>;
