//! Error types for the workflow core.

use thiserror::Error;

/// Errors surfaced by the engine, step executor and validator.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Storage collaborator error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Definition parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Step or parameter validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Device operation error
    #[error("Device error: {0}")]
    Device(String),

    /// Step exceeded its timeout
    #[error("Step timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Execution was cancelled; never reported as a failure
    #[error("Execution cancelled")]
    Cancelled,

    /// Sub-workflow step failure, tagged with the inner step position
    #[error("sub-workflow step {index} ({name}) failed: {source}")]
    SubWorkflow {
        index: usize,
        name: String,
        source: Box<EngineError>,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal invariant violation
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Whether this error stems from a fired cancellation scope,
    /// including one propagated out of a sub-workflow.
    pub fn is_cancelled(&self) -> bool {
        match self {
            EngineError::Cancelled => true,
            EngineError::SubWorkflow { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Result type alias using EngineError.
pub type EngineResult<T> = Result<T, EngineError>;
