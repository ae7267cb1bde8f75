//! Machine state machine over the workflow engine.
//!
//! Operator commands map onto three configured workflows (stop, home,
//! production). Command handlers hold the controller lock only for state
//! mutation; engine calls happen outside it. Each accepted command spawns
//! one observer task that polls the engine's durable status and advances
//! the state machine.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::time::interval;
use uuid::Uuid;

use machina_workflow::storage::ExecutionStatus;
use machina_workflow::{StepData, WorkflowEngine};

use crate::config::MachineConfig;
use crate::error::{MachineError, MachineResult};
use crate::states::{MachineCommand, MachineState, MachineStatus};

struct ControllerState {
    state: MachineState,
    current_execution: Option<Uuid>,
    production_cycles: u64,
    error_message: Option<String>,
    last_state_change: DateTime<Utc>,

    stop_workflow: Option<Uuid>,
    home_workflow: Option<Uuid>,
    production_workflow: Option<Uuid>,
}

pub struct MachineController {
    engine: Arc<WorkflowEngine>,
    poll_interval: Duration,
    state: Mutex<ControllerState>,
}

impl MachineController {
    pub fn new(engine: Arc<WorkflowEngine>, config: MachineConfig) -> Self {
        Self {
            engine,
            poll_interval: config.poll_interval,
            state: Mutex::new(ControllerState {
                state: MachineState::Stopped,
                current_execution: None,
                production_cycles: 0,
                error_message: None,
                last_state_change: Utc::now(),
                stop_workflow: config.stop_workflow_id,
                home_workflow: config.home_workflow_id,
                production_workflow: config.production_workflow_id,
            }),
        }
    }

    /// Configure the three machine workflows.
    pub fn set_workflows(&self, stop: Uuid, home: Uuid, production: Uuid) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.stop_workflow = Some(stop);
        state.home_workflow = Some(home);
        state.production_workflow = Some(production);

        tracing::info!(
            stop = %stop,
            home = %home,
            production = %production,
            "Machine workflows configured"
        );
    }

    /// Snapshot of the externally visible state.
    pub fn status(&self) -> MachineStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        MachineStatus {
            state: state.state,
            execution_id: state.current_execution,
            error_message: state.error_message.clone(),
            production_cycles: state.production_cycles,
            last_state_change: state.last_state_change,
        }
    }

    /// Handle an operator command.
    pub async fn execute_command(self: &Arc<Self>, command: MachineCommand) -> MachineResult<()> {
        let current = self.state.lock().unwrap_or_else(|e| e.into_inner()).state;
        tracing::info!(command = %command, state = %current, "Machine command received");

        match command {
            MachineCommand::Home => self.execute_home().await,
            MachineCommand::Start => self.execute_start().await,
            MachineCommand::Stop => self.execute_stop().await,
            MachineCommand::Reset => self.execute_reset(),
        }
    }

    async fn execute_home(self: &Arc<Self>) -> MachineResult<()> {
        let home_workflow = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.state != MachineState::Stopped {
                return Err(preconditions(
                    "home",
                    format!("machine must be stopped (current: {})", state.state),
                ));
            }
            let Some(id) = state.home_workflow else {
                return Err(MachineError::Config("home workflow not configured".to_string()));
            };
            transition(&mut state, MachineState::Homing, None);
            id
        };

        let execution_id = match self.engine.execute(home_workflow, StepData::new()).await {
            Ok(id) => id,
            Err(err) => {
                self.set_state(MachineState::Error, Some(err.to_string()));
                return Err(err.into());
            }
        };

        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_execution = Some(execution_id);
        self.spawn_observer(execution_id, MachineState::Ready);
        Ok(())
    }

    async fn execute_start(self: &Arc<Self>) -> MachineResult<()> {
        let production_workflow = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.state != MachineState::Ready {
                return Err(preconditions(
                    "start",
                    format!("machine must be ready (current: {})", state.state),
                ));
            }
            let Some(id) = state.production_workflow else {
                return Err(MachineError::Config(
                    "production workflow not configured".to_string(),
                ));
            };
            transition(&mut state, MachineState::Running, None);
            state.production_cycles = 0;
            id
        };

        let execution_id = match self.engine.execute(production_workflow, StepData::new()).await {
            Ok(id) => id,
            Err(err) => {
                self.set_state(MachineState::Error, Some(err.to_string()));
                return Err(err.into());
            }
        };

        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_execution = Some(execution_id);
        self.spawn_production_observer(execution_id);
        Ok(())
    }

    async fn execute_stop(self: &Arc<Self>) -> MachineResult<()> {
        let (stop_workflow, running_execution) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.state != MachineState::Running {
                return Err(preconditions(
                    "stop",
                    format!("machine not running (current: {})", state.state),
                ));
            }
            let Some(id) = state.stop_workflow else {
                return Err(MachineError::Config("stop workflow not configured".to_string()));
            };
            transition(&mut state, MachineState::Stopping, None);
            (id, state.current_execution)
        };

        // The production run may already have finished on its own.
        if let Some(execution_id) = running_execution {
            if let Err(err) = self.engine.cancel(execution_id) {
                tracing::debug!(execution_id = %execution_id, error = %err, "Production cancel skipped");
            }
        }

        let execution_id = match self.engine.execute(stop_workflow, StepData::new()).await {
            Ok(id) => id,
            Err(err) => {
                self.set_state(MachineState::Error, Some(err.to_string()));
                return Err(err.into());
            }
        };

        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .current_execution = Some(execution_id);
        self.spawn_observer(execution_id, MachineState::Stopped);
        Ok(())
    }

    fn execute_reset(&self) -> MachineResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.state != MachineState::Error && state.state != MachineState::Emergency {
            return Err(preconditions(
                "reset",
                format!("no error state (current: {})", state.state),
            ));
        }

        transition(&mut state, MachineState::Stopped, None);
        state.current_execution = None;

        tracing::info!("Machine reset to stopped state");
        Ok(())
    }

    /// Poll until the watched execution terminates, then advance the state
    /// machine. Cancelled executions exit silently (expected for stop).
    fn spawn_observer(self: &Arc<Self>, execution_id: Uuid, target: MachineState) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(controller.poll_interval);
            loop {
                ticker.tick().await;

                let (exec, _steps) = match controller.engine.get_execution_status(execution_id).await
                {
                    Ok(status) => status,
                    Err(err) => {
                        tracing::warn!(
                            execution_id = %execution_id,
                            error = %err,
                            "Failed to read execution status"
                        );
                        continue;
                    }
                };

                match exec.status {
                    ExecutionStatus::Success => {
                        controller.set_state(target, None);
                        tracing::info!(
                            execution_id = %execution_id,
                            state = %target,
                            "Workflow completed"
                        );
                        return;
                    }
                    ExecutionStatus::Failed => {
                        tracing::error!(
                            execution_id = %execution_id,
                            error = exec.error.as_deref().unwrap_or(""),
                            "Workflow failed"
                        );
                        controller.set_state(MachineState::Error, exec.error);
                        return;
                    }
                    ExecutionStatus::Cancelled => return,
                    ExecutionStatus::Pending | ExecutionStatus::Running => {}
                }
            }
        });
    }

    /// Watch the production run: mirror its iteration counter and surface
    /// failures. Exits once the machine leaves `running`.
    fn spawn_production_observer(self: &Arc<Self>, execution_id: Uuid) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = interval(controller.poll_interval);
            loop {
                ticker.tick().await;

                if controller.state.lock().unwrap_or_else(|e| e.into_inner()).state
                    != MachineState::Running
                {
                    return;
                }

                let (exec, _steps) = match controller.engine.get_execution_status(execution_id).await
                {
                    Ok(status) => status,
                    Err(_) => continue,
                };

                if let Some(output) = &exec.output {
                    if let Some(cycles) = output.get("iterations_completed").and_then(Value::as_u64)
                    {
                        controller
                            .state
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .production_cycles = cycles;
                    }
                }

                if exec.status == ExecutionStatus::Failed {
                    tracing::error!(
                        execution_id = %execution_id,
                        error = exec.error.as_deref().unwrap_or(""),
                        "Production workflow failed"
                    );
                    controller.set_state(MachineState::Error, exec.error);
                    return;
                }
            }
        });
    }

    fn set_state(&self, state: MachineState, error: Option<String>) {
        let mut inner = self.state.lock().unwrap_or_else(|e| e.into_inner());
        transition(&mut inner, state, error);
    }
}

fn transition(inner: &mut ControllerState, state: MachineState, error: Option<String>) {
    let previous = inner.state;
    inner.state = state;
    inner.error_message = error.clone();
    inner.last_state_change = Utc::now();

    tracing::info!(
        state = %state,
        previous = %previous,
        error = error.as_deref().unwrap_or(""),
        "Machine state changed"
    );
}

fn preconditions(command: &str, reason: String) -> MachineError {
    MachineError::Preconditions {
        command: command.to_string(),
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use machina_workflow::storage::Storage;
    use machina_workflow::stubs::{InMemoryStorage, StubDevice, StubDeviceManager};
    use machina_workflow::{EventStreamer, StepExecutor};
    use serde_json::json;
    use std::time::Instant;

    struct Harness {
        controller: Arc<MachineController>,
        engine: Arc<WorkflowEngine>,
        storage: Arc<InMemoryStorage>,
        stop_id: Uuid,
        home_id: Uuid,
        production_id: Uuid,
    }

    /// Engine + controller wired over in-memory collaborators, with a
    /// quick home workflow, a looping production workflow and a stop
    /// workflow that toggles a register.
    fn make_harness() -> Harness {
        let storage = Arc::new(InMemoryStorage::new());
        storage.insert_device("D1", true);

        let manager = StubDeviceManager::new();
        manager.insert(Arc::new(StubDevice::new("D1")));

        let engine = Arc::new(WorkflowEngine::new(
            Arc::clone(&storage) as Arc<dyn Storage>,
            StepExecutor::new(Arc::new(manager)),
            Arc::new(EventStreamer::new()),
        ));

        let stop_id = Uuid::new_v4();
        storage.insert_workflow(
            stop_id,
            "stop",
            json!({
                "name": "stop",
                "program_name": "stop",
                "version": "1",
                "steps": [{
                    "number": "10",
                    "name": "park",
                    "type": "device",
                    "device_id": "D1",
                    "operation": "write_logical",
                    "parameters": {"register": "PARKED", "value": true}
                }]
            }),
        );

        let home_id = Uuid::new_v4();
        storage.insert_workflow(
            home_id,
            "home",
            json!({
                "name": "home",
                "program_name": "home",
                "version": "1",
                "steps": [{"number": "10", "name": "settle", "type": "wait", "timeout": "10ms"}]
            }),
        );

        let production_id = Uuid::new_v4();
        storage.insert_workflow(
            production_id,
            "production",
            json!({
                "name": "production",
                "program_name": "prod",
                "version": "1",
                "steps": [{"number": "10", "name": "cycle", "type": "wait", "timeout": "10ms"}],
                "loop": {"enabled": true, "max_count": 0}
            }),
        );

        let config = MachineConfig {
            stop_workflow_id: None,
            home_workflow_id: None,
            production_workflow_id: None,
            poll_interval: Duration::from_millis(10),
        };
        let controller = Arc::new(MachineController::new(Arc::clone(&engine), config));
        controller.set_workflows(stop_id, home_id, production_id);

        Harness {
            controller,
            engine,
            storage,
            stop_id,
            home_id,
            production_id,
        }
    }

    async fn wait_for_state(controller: &Arc<MachineController>, target: MachineState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while controller.status().state != target {
            assert!(
                Instant::now() < deadline,
                "machine never reached {:?}, stuck in {:?}",
                target,
                controller.status().state
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn force_state(controller: &Arc<MachineController>, state: MachineState) {
        controller
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .state = state;
    }

    #[tokio::test]
    async fn test_home_reaches_ready() {
        let harness = make_harness();
        harness
            .controller
            .execute_command(MachineCommand::Home)
            .await
            .unwrap();
        assert_eq!(harness.controller.status().state, MachineState::Homing);
        wait_for_state(&harness.controller, MachineState::Ready).await;
    }

    #[tokio::test]
    async fn test_home_failure_reaches_error() {
        let harness = make_harness();
        harness.storage.insert_workflow(
            harness.home_id,
            "home",
            json!({
                "name": "home",
                "program_name": "home",
                "version": "1",
                "steps": [{
                    "number": "10",
                    "name": "bad",
                    "type": "device",
                    "device_id": "missing",
                    "operation": "read_logical",
                    "parameters": {"register": "X"}
                }]
            }),
        );

        harness
            .controller
            .execute_command(MachineCommand::Home)
            .await
            .unwrap();
        wait_for_state(&harness.controller, MachineState::Error).await;
        assert!(harness
            .controller
            .status()
            .error_message
            .unwrap()
            .contains("device not found"));
    }

    #[tokio::test]
    async fn test_start_then_stop_round_trip() {
        let harness = make_harness();
        force_state(&harness.controller, MachineState::Ready);

        harness
            .controller
            .execute_command(MachineCommand::Start)
            .await
            .unwrap();
        assert_eq!(harness.controller.status().state, MachineState::Running);
        let production_execution = harness.controller.status().execution_id.unwrap();

        // Let production loop a few times so cycles are observable.
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(harness.controller.status().production_cycles > 0);

        harness
            .controller
            .execute_command(MachineCommand::Stop)
            .await
            .unwrap();
        wait_for_state(&harness.controller, MachineState::Stopped).await;

        // Production run was cancelled, stop workflow ran to completion.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let (exec, _) = harness
                .engine
                .get_execution_status(production_execution)
                .await
                .unwrap();
            if exec.status == ExecutionStatus::Cancelled {
                break;
            }
            assert!(Instant::now() < deadline, "production run never cancelled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_failing_stop_workflow_reaches_error() {
        let harness = make_harness();
        harness.storage.insert_workflow(
            harness.stop_id,
            "stop",
            json!({
                "name": "stop",
                "program_name": "stop",
                "version": "1",
                "steps": [{
                    "number": "10",
                    "name": "bad",
                    "type": "device",
                    "device_id": "missing",
                    "operation": "read_logical",
                    "parameters": {"register": "X"}
                }]
            }),
        );
        force_state(&harness.controller, MachineState::Ready);

        harness
            .controller
            .execute_command(MachineCommand::Start)
            .await
            .unwrap();
        harness
            .controller
            .execute_command(MachineCommand::Stop)
            .await
            .unwrap();
        wait_for_state(&harness.controller, MachineState::Error).await;
    }

    #[tokio::test]
    async fn test_reset_clears_error() {
        let harness = make_harness();
        force_state(&harness.controller, MachineState::Error);

        harness
            .controller
            .execute_command(MachineCommand::Reset)
            .await
            .unwrap();
        let status = harness.controller.status();
        assert_eq!(status.state, MachineState::Stopped);
        assert!(status.execution_id.is_none());
        assert!(status.error_message.is_none());
    }

    #[tokio::test]
    async fn test_commands_rejected_in_wrong_state() {
        let harness = make_harness();

        // Stopped machine: only home (and no reset without an error).
        let err = harness
            .controller
            .execute_command(MachineCommand::Start)
            .await
            .unwrap_err();
        assert!(matches!(err, MachineError::Preconditions { .. }));
        assert!(harness
            .controller
            .execute_command(MachineCommand::Stop)
            .await
            .is_err());
        assert!(harness
            .controller
            .execute_command(MachineCommand::Reset)
            .await
            .is_err());
        assert_eq!(harness.controller.status().state, MachineState::Stopped);

        force_state(&harness.controller, MachineState::Running);
        assert!(harness
            .controller
            .execute_command(MachineCommand::Home)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_production_failure_reaches_error() {
        let harness = make_harness();
        harness.storage.insert_workflow(
            harness.production_id,
            "production",
            json!({
                "name": "production",
                "program_name": "prod",
                "version": "1",
                "steps": [{
                    "number": "10",
                    "name": "bad",
                    "type": "device",
                    "device_id": "missing",
                    "operation": "read_logical",
                    "parameters": {"register": "X"}
                }]
            }),
        );
        force_state(&harness.controller, MachineState::Ready);

        harness
            .controller
            .execute_command(MachineCommand::Start)
            .await
            .unwrap();
        wait_for_state(&harness.controller, MachineState::Error).await;
    }
}
