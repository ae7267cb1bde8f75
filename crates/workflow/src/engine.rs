//! Workflow engine: owns executions end to end.
//!
//! `execute` persists a pending record, spawns a runner task bound to a
//! cancellable scope and returns the execution id immediately. The runner
//! drives steps in order, persists progress after every step, publishes one
//! event per lifecycle transition and always removes itself from the
//! running-table on exit. Sub-workflow steps are expanded here, where the
//! call stack lives, so inner steps get durable records with correct
//! hierarchical ids.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::definition::{self, LoopErrorPolicy, Step, StepType, Workflow};
use crate::error::{EngineError, EngineResult};
use crate::executor::{StepData, StepExecutor};
use crate::storage::{
    ExecutionEvent, ExecutionStatus, ExecutionStep, Storage, WorkflowExecution,
};
use crate::streaming::EventStreamer;
use crate::tracker::ExecutionTracker;

/// Cancel handle and tracker for one live execution.
struct RunningExecution {
    cancel: CancellationToken,
    tracker: Arc<ExecutionTracker>,
}

pub struct WorkflowEngine {
    storage: Arc<dyn Storage>,
    executor: StepExecutor,
    streamer: Arc<EventStreamer>,
    running: RwLock<HashMap<Uuid, RunningExecution>>,
}

impl WorkflowEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        executor: StepExecutor,
        streamer: Arc<EventStreamer>,
    ) -> Self {
        Self {
            storage,
            executor,
            streamer,
            running: RwLock::new(HashMap::new()),
        }
    }

    /// Streamer observers subscribe through.
    pub fn streamer(&self) -> &Arc<EventStreamer> {
        &self.streamer
    }

    /// Start an execution of `workflow_id` and return its id immediately.
    ///
    /// Load and parse failures surface to the caller; no execution record
    /// is created for them.
    pub async fn execute(self: &Arc<Self>, workflow_id: Uuid, input: StepData) -> EngineResult<Uuid> {
        let record = self
            .storage
            .load_workflow(workflow_id)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to load workflow: {}", e)))?;
        let workflow = definition::parse_workflow(&record.definition)?;

        let execution_id = Uuid::new_v4();
        let exec = WorkflowExecution {
            id: execution_id,
            workflow_id,
            status: ExecutionStatus::Pending,
            current_step_index: 0,
            current_step_id: String::new(),
            call_stack: Value::Array(Vec::new()),
            input: Value::Object(input.clone()),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        self.storage
            .create_execution(&exec)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to create execution: {}", e)))?;

        // The execution outlives the caller; its cancellation scope is
        // rooted here, not in the caller's request context.
        let cancel = CancellationToken::new();
        let tracker = Arc::new(ExecutionTracker::new(execution_id));
        tracker.push(&workflow_id.to_string(), &workflow.program_name, "0");

        self.running
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                execution_id,
                RunningExecution {
                    cancel: cancel.clone(),
                    tracker: Arc::clone(&tracker),
                },
            );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine
                .run_execution(&cancel, &tracker, exec, workflow, input)
                .await;
            engine
                .running
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&execution_id);
        });

        Ok(execution_id)
    }

    /// Request cancellation of a running execution.
    ///
    /// Cooperative: takes effect when the runner next observes the scope
    /// between steps, or inside a step that honours it (waits and device
    /// timeouts do).
    pub fn cancel(&self, execution_id: Uuid) -> EngineResult<()> {
        let running = self.running.read().unwrap_or_else(|e| e.into_inner());
        match running.get(&execution_id) {
            Some(run) => {
                run.cancel.cancel();
                tracing::info!(execution_id = %execution_id, "Execution cancellation requested");
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "execution not found or not running: {}",
                execution_id
            ))),
        }
    }

    /// Tracker of a live execution, for observers. `None` once the runner
    /// has exited.
    pub fn tracker(&self, execution_id: Uuid) -> Option<Arc<ExecutionTracker>> {
        self.running
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&execution_id)
            .map(|run| Arc::clone(&run.tracker))
    }

    /// Durable execution record plus its step records.
    pub async fn get_execution_status(
        &self,
        execution_id: Uuid,
    ) -> EngineResult<(WorkflowExecution, Vec<ExecutionStep>)> {
        let exec = self.storage.get_execution(execution_id).await?;
        let steps = self.storage.get_steps(execution_id).await?;
        Ok((exec, steps))
    }

    async fn run_execution(
        &self,
        cancel: &CancellationToken,
        tracker: &ExecutionTracker,
        mut exec: WorkflowExecution,
        workflow: Workflow,
        input: StepData,
    ) {
        exec.status = ExecutionStatus::Running;
        self.persist_execution(&mut exec, tracker).await;
        self.publish_event(exec.id, "execution.started", json!({})).await;

        tracing::info!(
            execution_id = %exec.id,
            workflow_id = %exec.workflow_id,
            workflow = %workflow.name,
            "Execution started"
        );

        let loop_enabled = workflow
            .loop_config
            .as_ref()
            .map(|l| l.enabled)
            .unwrap_or(false);
        let max_iterations = workflow
            .loop_config
            .as_ref()
            .map(|l| l.max_count.max(0) as u64)
            .unwrap_or(0);
        let on_error = workflow
            .loop_config
            .as_ref()
            .map(|l| l.on_error)
            .unwrap_or(LoopErrorPolicy::Stop);

        let mut current = input;
        let mut iterations_completed: u64 = 0;
        let mut attempts: u64 = 0;
        let mut next_index: i32 = 0;

        loop {
            attempts += 1;
            match self
                .run_steps(cancel, tracker, &mut exec, &workflow, current.clone(), &mut next_index)
                .await
            {
                Ok(output) => {
                    current = output;
                    if loop_enabled {
                        iterations_completed += 1;
                        // Persist the counter so observers see live progress.
                        let mut progress = current.clone();
                        progress.insert(
                            "iterations_completed".to_string(),
                            json!(iterations_completed),
                        );
                        exec.output = Some(Value::Object(progress));
                        self.persist_execution(&mut exec, tracker).await;
                    }
                }
                Err(err) if err.is_cancelled() || cancel.is_cancelled() => {
                    self.finish(&mut exec, tracker, ExecutionStatus::Cancelled, None, None)
                        .await;
                    self.publish_event(exec.id, "execution.cancelled", json!({})).await;
                    return;
                }
                Err(err) => {
                    if loop_enabled && on_error == LoopErrorPolicy::Continue {
                        tracing::warn!(
                            execution_id = %exec.id,
                            error = %err,
                            "Iteration failed, continuing"
                        );
                    } else {
                        let message = err.to_string();
                        self.finish(
                            &mut exec,
                            tracker,
                            ExecutionStatus::Failed,
                            None,
                            Some(message.clone()),
                        )
                        .await;
                        self.publish_event(exec.id, "execution.failed", json!({ "error": message }))
                            .await;
                        return;
                    }
                }
            }

            if !loop_enabled {
                break;
            }
            if cancel.is_cancelled() {
                self.finish(&mut exec, tracker, ExecutionStatus::Cancelled, None, None)
                    .await;
                self.publish_event(exec.id, "execution.cancelled", json!({})).await;
                return;
            }
            if max_iterations > 0 && attempts >= max_iterations {
                break;
            }
        }

        if loop_enabled {
            current.insert(
                "iterations_completed".to_string(),
                json!(iterations_completed),
            );
        }
        self.finish(
            &mut exec,
            tracker,
            ExecutionStatus::Success,
            Some(Value::Object(current.clone())),
            None,
        )
        .await;
        self.publish_event(exec.id, "execution.completed", Value::Object(current))
            .await;
    }

    /// One pass over the workflow's step list, threading outputs.
    async fn run_steps(
        &self,
        cancel: &CancellationToken,
        tracker: &ExecutionTracker,
        exec: &mut WorkflowExecution,
        workflow: &Workflow,
        input: StepData,
        next_index: &mut i32,
    ) -> EngineResult<StepData> {
        let mut current = input;
        for step in &workflow.steps {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            current = self
                .execute_step(cancel, tracker, exec, step, current, next_index)
                .await?;
            self.persist_execution(exec, tracker).await;
        }
        Ok(current)
    }

    /// Execute one step: durable record, events, dispatch.
    async fn execute_step(
        &self,
        cancel: &CancellationToken,
        tracker: &ExecutionTracker,
        exec: &mut WorkflowExecution,
        step: &Step,
        input: StepData,
        next_index: &mut i32,
    ) -> EngineResult<StepData> {
        let step_index = *next_index;
        *next_index += 1;

        tracker.set_current_step(&step.number);
        let hierarchical_id = tracker.hierarchical_step_id();
        let depth = tracker.depth() as i32;
        exec.current_step_index = step_index;

        let mut record = ExecutionStep {
            id: Uuid::new_v4(),
            execution_id: exec.id,
            step_index,
            step_name: step.name.clone(),
            hierarchical_step_id: hierarchical_id.clone(),
            depth,
            status: ExecutionStatus::Running,
            input: Value::Object(input.clone()),
            output: None,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        if let Err(err) = self.storage.create_step(&record).await {
            tracing::warn!(execution_id = %exec.id, error = %err, "Failed to persist step record");
        }
        self.publish_event(
            exec.id,
            "step.started",
            json!({
                "step_index": step_index,
                "step_name": step.name,
                "hierarchical_step_id": hierarchical_id,
                "depth": depth,
            }),
        )
        .await;

        tracing::debug!(
            execution_id = %exec.id,
            step = %hierarchical_id,
            name = %step.name,
            "Executing step"
        );

        let result = match step.step_type {
            StepType::Workflow => {
                self.execute_sub_workflow(cancel, tracker, exec, step, input, next_index)
                    .await
            }
            _ => self.executor.execute(cancel, step, &input).await,
        };

        record.completed_at = Some(Utc::now());
        match result {
            Ok(output) => {
                record.status = ExecutionStatus::Success;
                record.output = Some(Value::Object(output.clone()));
                if let Err(err) = self.storage.update_step(&record).await {
                    tracing::warn!(execution_id = %exec.id, error = %err, "Failed to persist step record");
                }
                self.publish_event(
                    exec.id,
                    "step.completed",
                    json!({
                        "step_index": step_index,
                        "step_name": step.name,
                        "hierarchical_step_id": hierarchical_id,
                        "depth": depth,
                        "output": output,
                    }),
                )
                .await;
                Ok(output)
            }
            Err(err) => {
                let message = err.to_string();
                record.status = ExecutionStatus::Failed;
                record.error = Some(message.clone());
                if let Err(update_err) = self.storage.update_step(&record).await {
                    tracing::warn!(execution_id = %exec.id, error = %update_err, "Failed to persist step record");
                }
                self.publish_event(
                    exec.id,
                    "step.failed",
                    json!({
                        "step_index": step_index,
                        "step_name": step.name,
                        "hierarchical_step_id": hierarchical_id,
                        "depth": depth,
                        "error": message,
                    }),
                )
                .await;
                Err(err)
            }
        }
    }

    /// Expand a sub-workflow step: load the referenced workflow and run its
    /// steps in place, with a frame pushed for the duration of the call.
    async fn execute_sub_workflow(
        &self,
        cancel: &CancellationToken,
        tracker: &ExecutionTracker,
        exec: &mut WorkflowExecution,
        step: &Step,
        input: StepData,
        next_index: &mut i32,
    ) -> EngineResult<StepData> {
        let raw_id = step.workflow_id.as_deref().unwrap_or_default();
        let sub_id = Uuid::parse_str(raw_id)
            .map_err(|e| EngineError::Validation(format!("invalid workflow_id: {}", e)))?;

        let record = self
            .storage
            .load_workflow(sub_id)
            .await
            .map_err(|e| EngineError::Storage(format!("failed to load sub-workflow: {}", e)))?;
        let sub_workflow = definition::parse_workflow(&record.definition)
            .map_err(|e| EngineError::Parse(format!("failed to parse sub-workflow: {}", e)))?;

        let timeout = step.timeout.map(|t| t.as_duration()).unwrap_or_default();

        tracker.push(&sub_id.to_string(), &sub_workflow.program_name, "0");
        let result = if timeout > Duration::ZERO {
            match tokio::time::timeout(
                timeout,
                self.run_sub_steps(cancel, tracker, exec, &sub_workflow, input, next_index),
            )
            .await
            {
                Ok(inner) => inner,
                Err(_) => Err(EngineError::Timeout(timeout)),
            }
        } else {
            self.run_sub_steps(cancel, tracker, exec, &sub_workflow, input, next_index)
                .await
        };
        tracker.pop();
        result
    }

    async fn run_sub_steps(
        &self,
        cancel: &CancellationToken,
        tracker: &ExecutionTracker,
        exec: &mut WorkflowExecution,
        workflow: &Workflow,
        input: StepData,
        next_index: &mut i32,
    ) -> EngineResult<StepData> {
        let mut current = input;
        for (index, sub_step) in workflow.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            current =
                Box::pin(self.execute_step(cancel, tracker, exec, sub_step, current, next_index))
                    .await
                    .map_err(|err| match err {
                        EngineError::Cancelled => EngineError::Cancelled,
                        other => EngineError::SubWorkflow {
                            index,
                            name: sub_step.name.clone(),
                            source: Box::new(other),
                        },
                    })?;
        }
        Ok(current)
    }

    /// Terminal transition: status, timestamp, snapshot, persistence.
    async fn finish(
        &self,
        exec: &mut WorkflowExecution,
        tracker: &ExecutionTracker,
        status: ExecutionStatus,
        output: Option<Value>,
        error: Option<String>,
    ) {
        exec.status = status;
        exec.completed_at = Some(Utc::now());
        if output.is_some() {
            exec.output = output;
        }
        exec.error = error;
        self.persist_execution(exec, tracker).await;
        tracing::info!(execution_id = %exec.id, status = %status, "Execution finished");
    }

    /// Persist the execution record with the current call-stack snapshot.
    async fn persist_execution(&self, exec: &mut WorkflowExecution, tracker: &ExecutionTracker) {
        exec.current_step_id = tracker.hierarchical_step_id();
        exec.call_stack =
            serde_json::to_value(tracker.call_stack_snapshot()).unwrap_or(Value::Null);
        if let Err(err) = self.storage.update_execution(exec).await {
            tracing::warn!(execution_id = %exec.id, error = %err, "Failed to persist execution");
        }
    }

    /// Durable write, then best-effort fan-out to live subscribers.
    async fn publish_event(&self, execution_id: Uuid, event_type: &str, payload: Value) {
        let event = ExecutionEvent {
            id: Uuid::new_v4(),
            execution_id,
            event_type: event_type.to_string(),
            payload,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.storage.create_event(&event).await {
            tracing::warn!(
                execution_id = %execution_id,
                event_type,
                error = %err,
                "Failed to persist event"
            );
        }
        self.streamer.broadcast(execution_id, &event).await;
    }
}
