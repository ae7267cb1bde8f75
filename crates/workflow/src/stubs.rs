//! In-memory collaborators for tests and local wiring.
//!
//! Non-durable implementations of [`Storage`] and the device interfaces.
//! They mirror only as much behaviour as the core needs and make no
//! concurrency or durability promises beyond interior mutability.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::device::{Device, DeviceManager};
use crate::error::{EngineError, EngineResult};
use crate::storage::{
    ExecutionEvent, ExecutionStep, Storage, WorkflowExecution, WorkflowRecord,
};

/// In-memory storage backend.
#[derive(Default)]
pub struct InMemoryStorage {
    workflows: Mutex<HashMap<Uuid, WorkflowRecord>>,
    /// Device instance name -> enabled flag.
    devices: Mutex<HashMap<String, bool>>,
    executions: Mutex<HashMap<Uuid, WorkflowExecution>>,
    steps: Mutex<Vec<ExecutionStep>>,
    events: Mutex<Vec<ExecutionEvent>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow definition.
    pub fn insert_workflow(&self, id: Uuid, name: &str, definition: Value) {
        self.workflows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                WorkflowRecord {
                    id,
                    workflow_name: name.to_string(),
                    definition,
                    active: true,
                },
            );
    }

    /// Register a device instance name with its enabled flag.
    pub fn insert_device(&self, name: &str, enabled: bool) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), enabled);
    }

    /// All persisted events for an execution, in creation order.
    pub fn events_for(&self, execution_id: Uuid) -> Vec<ExecutionEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect()
    }

    /// All persisted step records for an execution, in creation order.
    pub fn steps_for(&self, execution_id: Uuid) -> Vec<ExecutionStep> {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn load_workflow(&self, id: Uuid) -> EngineResult<WorkflowRecord> {
        self.workflows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("workflow not found: {}", id)))
    }

    async fn workflow_exists(&self, id: Uuid) -> EngineResult<bool> {
        Ok(self
            .workflows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&id))
    }

    async fn device_exists_enabled_by_name(&self, name: &str) -> EngineResult<(bool, bool)> {
        let devices = self.devices.lock().unwrap_or_else(|e| e.into_inner());
        match devices.get(name) {
            Some(enabled) => Ok((true, *enabled)),
            None => Ok((false, false)),
        }
    }

    async fn create_execution(&self, exec: &WorkflowExecution) -> EngineResult<()> {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(exec.id, exec.clone());
        Ok(())
    }

    async fn update_execution(&self, exec: &WorkflowExecution) -> EngineResult<()> {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(exec.id, exec.clone());
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> EngineResult<WorkflowExecution> {
        self.executions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("execution not found: {}", id)))
    }

    async fn create_step(&self, step: &ExecutionStep) -> EngineResult<()> {
        self.steps
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(step.clone());
        Ok(())
    }

    async fn update_step(&self, step: &ExecutionStep) -> EngineResult<()> {
        let mut steps = self.steps.lock().unwrap_or_else(|e| e.into_inner());
        match steps.iter_mut().find(|s| s.id == step.id) {
            Some(existing) => {
                *existing = step.clone();
                Ok(())
            }
            None => Err(EngineError::NotFound(format!(
                "execution step not found: {}",
                step.id
            ))),
        }
    }

    async fn get_steps(&self, execution_id: Uuid) -> EngineResult<Vec<ExecutionStep>> {
        Ok(self.steps_for(execution_id))
    }

    async fn create_event(&self, event: &ExecutionEvent) -> EngineResult<()> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

/// Scriptable in-memory device.
///
/// Named and logical registers share one map; numeric holding and input
/// registers each get their own.
pub struct StubDevice {
    name: String,
    registers: Mutex<HashMap<String, Value>>,
    holding: Mutex<HashMap<u16, u16>>,
    input: Mutex<HashMap<u16, u16>>,
}

impl StubDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            registers: Mutex::new(HashMap::new()),
            holding: Mutex::new(HashMap::new()),
            input: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_register(&self, register: &str, value: Value) {
        self.registers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(register.to_string(), value);
    }

    pub fn register_value(&self, register: &str) -> Option<Value> {
        self.registers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(register)
            .cloned()
    }

    pub fn set_holding(&self, address: u16, value: u16) {
        self.holding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, value);
    }

    pub fn holding_value(&self, address: u16) -> Option<u16> {
        self.holding
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&address)
            .copied()
    }

    pub fn set_input(&self, address: u16, value: u16) {
        self.input
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, value);
    }
}

#[async_trait]
impl Device for StubDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read_holding(&self, address: u16, count: u16) -> EngineResult<Vec<u16>> {
        let holding = self.holding.lock().unwrap_or_else(|e| e.into_inner());
        Ok((0..count)
            .map(|offset| *holding.get(&(address + offset)).unwrap_or(&0))
            .collect())
    }

    async fn read_input(&self, address: u16, count: u16) -> EngineResult<Vec<u16>> {
        let input = self.input.lock().unwrap_or_else(|e| e.into_inner());
        Ok((0..count)
            .map(|offset| *input.get(&(address + offset)).unwrap_or(&0))
            .collect())
    }

    async fn write_single_register(&self, address: u16, value: u16) -> EngineResult<()> {
        self.set_holding(address, value);
        Ok(())
    }

    async fn read_register(&self, register: &str) -> EngineResult<Value> {
        self.register_value(register).ok_or_else(|| {
            EngineError::Device(format!("unknown register {} on {}", register, self.name))
        })
    }

    async fn write_register(&self, register: &str, value: Value) -> EngineResult<()> {
        self.set_register(register, value);
        Ok(())
    }

    async fn read_logical(&self, name: &str) -> EngineResult<Value> {
        self.read_register(name).await
    }

    async fn write_logical(&self, name: &str, value: Value) -> EngineResult<()> {
        self.write_register(name, value).await
    }
}

/// Device registry backed by a plain map.
#[derive(Default)]
pub struct StubDeviceManager {
    devices: Mutex<HashMap<String, Arc<StubDevice>>>,
}

impl StubDeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Arc<StubDevice>) {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(device.name().to_string(), device);
    }
}

impl DeviceManager for StubDeviceManager {
    fn get_device_by_name(&self, name: &str) -> Option<Arc<dyn Device>> {
        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .map(|device| device as Arc<dyn Device>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stub_device_round_trip() {
        let device = StubDevice::new("gripper");
        device.write_logical("CLAMP", json!(true)).await.unwrap();
        assert_eq!(device.read_logical("CLAMP").await.unwrap(), json!(true));
        assert!(device.read_register("MISSING").await.is_err());
    }

    #[tokio::test]
    async fn test_stub_device_holding_registers() {
        let device = StubDevice::new("drive");
        device.write_single_register(10, 42).await.unwrap();
        device.set_holding(11, 7);
        assert_eq!(device.read_holding(10, 2).await.unwrap(), vec![42, 7]);
        assert_eq!(device.read_holding(100, 1).await.unwrap(), vec![0]);
    }

    #[tokio::test]
    async fn test_storage_device_lookup() {
        let storage = InMemoryStorage::new();
        storage.insert_device("D1", true);
        storage.insert_device("D2", false);

        assert_eq!(
            storage.device_exists_enabled_by_name("D1").await.unwrap(),
            (true, true)
        );
        assert_eq!(
            storage.device_exists_enabled_by_name("D2").await.unwrap(),
            (true, false)
        );
        assert_eq!(
            storage.device_exists_enabled_by_name("D3").await.unwrap(),
            (false, false)
        );
    }
}
