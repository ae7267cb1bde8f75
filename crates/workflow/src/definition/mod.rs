//! Workflow definitions: JSON parsing and the parsed type model.

mod types;

pub use types::{
    build_hierarchical_step_id, parse_duration, CallFrame, ErrorStrategy, LoopConfig,
    LoopErrorPolicy, Step, StepDuration, StepType, Workflow,
};

use crate::error::{EngineError, EngineResult};

/// Parse a stored definition blob into a [`Workflow`].
pub fn parse_workflow(definition: &serde_json::Value) -> EngineResult<Workflow> {
    serde_json::from_value(definition.clone())
        .map_err(|e| EngineError::Parse(format!("workflow definition JSON invalid: {}", e)))
}
