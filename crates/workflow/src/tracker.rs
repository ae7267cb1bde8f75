//! Per-execution call-stack tracking.

use std::sync::RwLock;

use uuid::Uuid;

use crate::definition::{build_hierarchical_step_id, CallFrame};

/// Mutable call-stack record for one running execution.
///
/// The owning runner is the only writer; observers read concurrently
/// through the interior lock. Accessors return copies, never aliases.
#[derive(Debug)]
pub struct ExecutionTracker {
    execution_id: Uuid,
    call_stack: RwLock<Vec<CallFrame>>,
}

impl ExecutionTracker {
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            call_stack: RwLock::new(Vec::new()),
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    /// Enter a sub-workflow: append a frame.
    pub fn push(&self, workflow_id: &str, program_name: &str, step_number: &str) {
        self.call_stack
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(CallFrame {
                workflow_id: workflow_id.to_string(),
                program_name: program_name.to_string(),
                step_number: step_number.to_string(),
            });
    }

    /// Return from a sub-workflow. No-op on an empty stack.
    pub fn pop(&self) {
        self.call_stack
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .pop();
    }

    /// Overwrite the top frame's step number. No-op on an empty stack.
    pub fn set_current_step(&self, step_number: &str) {
        if let Some(frame) = self
            .call_stack
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .last_mut()
        {
            frame.step_number = step_number.to_string();
        }
    }

    /// Nesting depth below the root program: 0 for top-level steps.
    pub fn depth(&self) -> usize {
        self.call_stack
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
            .saturating_sub(1)
    }

    /// Hierarchical rendering of the current call stack.
    pub fn hierarchical_step_id(&self) -> String {
        build_hierarchical_step_id(&self.call_stack.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Owned copy of the current call stack, root first.
    pub fn call_stack_snapshot(&self) -> Vec<CallFrame> {
        self.call_stack
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
