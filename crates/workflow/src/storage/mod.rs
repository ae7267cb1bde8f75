//! Storage interface consumed by the core.
//!
//! The relational store itself lives outside this crate; the engine and
//! validator reach it exclusively through [`Storage`].

mod models;

pub use models::{
    ExecutionEvent, ExecutionStatus, ExecutionStep, WorkflowExecution, WorkflowRecord,
};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::EngineResult;

/// Persistence operations the engine and validator require.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load a stored workflow by id.
    async fn load_workflow(&self, id: Uuid) -> EngineResult<WorkflowRecord>;

    /// Whether a workflow with this id exists.
    async fn workflow_exists(&self, id: Uuid) -> EngineResult<bool>;

    /// Whether a device with this instance name exists, and whether it is
    /// enabled.
    async fn device_exists_enabled_by_name(&self, name: &str) -> EngineResult<(bool, bool)>;

    async fn create_execution(&self, exec: &WorkflowExecution) -> EngineResult<()>;

    async fn update_execution(&self, exec: &WorkflowExecution) -> EngineResult<()>;

    async fn get_execution(&self, id: Uuid) -> EngineResult<WorkflowExecution>;

    async fn create_step(&self, step: &ExecutionStep) -> EngineResult<()>;

    async fn update_step(&self, step: &ExecutionStep) -> EngineResult<()>;

    /// All step records of an execution, ordered by step index.
    async fn get_steps(&self, execution_id: Uuid) -> EngineResult<Vec<ExecutionStep>>;

    async fn create_event(&self, event: &ExecutionEvent) -> EngineResult<()>;
}
