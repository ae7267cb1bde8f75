//! Stateless step evaluation.
//!
//! Dispatches a single step against its input. Device parameters merge
//! step `parameters` with the threaded input, input winning on collision.
//! Sub-workflow steps are expanded by the engine, which owns the call
//! stack; the executor only ever sees device and wait steps.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::definition::{Step, StepType};
use crate::device::{Device, DeviceManager};
use crate::error::{EngineError, EngineResult};

/// Default sleep for `wait` steps without an explicit timeout.
const DEFAULT_WAIT: Duration = Duration::from_secs(1);

/// Input/output payload threaded between steps.
pub type StepData = Map<String, Value>;

/// Evaluates a single step against its input.
pub struct StepExecutor {
    devices: Arc<dyn DeviceManager>,
}

impl StepExecutor {
    pub fn new(devices: Arc<dyn DeviceManager>) -> Self {
        Self { devices }
    }

    pub async fn execute(
        &self,
        cancel: &CancellationToken,
        step: &Step,
        input: &StepData,
    ) -> EngineResult<StepData> {
        match &step.step_type {
            StepType::Device => self.execute_device_step(cancel, step, input).await,
            StepType::Wait => self.execute_wait_step(cancel, step, input).await,
            StepType::Workflow => Err(EngineError::Internal(
                "workflow steps are expanded by the engine".to_string(),
            )),
            StepType::Other(other) => Err(EngineError::Validation(format!(
                "unsupported step type: {}",
                other
            ))),
        }
    }

    async fn execute_device_step(
        &self,
        cancel: &CancellationToken,
        step: &Step,
        input: &StepData,
    ) -> EngineResult<StepData> {
        let device_id = step.device_id.as_deref().unwrap_or_default();
        let device = self
            .devices
            .get_device_by_name(device_id)
            .ok_or_else(|| EngineError::Device(format!("device not found: {}", device_id)))?;

        // Step parameters first, then input: execution input wins.
        let mut params = step.parameters.clone().unwrap_or_default();
        for (key, value) in input {
            params.insert(key.clone(), value.clone());
        }

        let operation = step.operation.as_deref().unwrap_or_default();
        let timeout = step.timeout.map(|t| t.as_duration()).unwrap_or_default();

        let operation_future = self.execute_operation(device, operation, &params);
        if timeout > Duration::ZERO {
            tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
                result = tokio::time::timeout(timeout, operation_future) => match result {
                    Ok(inner) => inner,
                    Err(_) => Err(EngineError::Timeout(timeout)),
                },
            }
        } else {
            tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
                result = operation_future => result,
            }
        }
    }

    async fn execute_operation(
        &self,
        device: Arc<dyn Device>,
        operation: &str,
        params: &StepData,
    ) -> EngineResult<StepData> {
        match operation {
            "read" => self.execute_read(device, params).await,
            "write" => self.execute_write(device, params).await,
            "read_register" => self.execute_read_register(device, params).await,
            "write_register" => self.execute_write_register(device, params).await,
            "read_logical" => self.execute_read_logical(device, params).await,
            "write_logical" => self.execute_write_logical(device, params).await,
            other => Err(EngineError::Validation(format!(
                "unsupported operation: {}",
                other
            ))),
        }
    }

    async fn execute_read(
        &self,
        device: Arc<dyn Device>,
        params: &StepData,
    ) -> EngineResult<StepData> {
        let register_type = string_param(params, "register_type")?;
        let address = number_param(params, "address")? as u16;
        let count = params
            .get("count")
            .and_then(Value::as_f64)
            .unwrap_or(1.0) as u16;

        let values = match register_type {
            "holding" => device.read_holding(address, count).await?,
            "input" => device.read_input(address, count).await?,
            other => {
                return Err(EngineError::Validation(format!(
                    "invalid register_type: {} (only 'holding' and 'input' supported)",
                    other
                )))
            }
        };

        let mut output = StepData::new();
        output.insert("values".to_string(), serde_json::json!(values));
        Ok(output)
    }

    async fn execute_write(
        &self,
        device: Arc<dyn Device>,
        params: &StepData,
    ) -> EngineResult<StepData> {
        let register_type = string_param(params, "register_type")?;
        let address = number_param(params, "address")? as u16;
        let value = number_param(params, "value")? as u16;

        if register_type != "holding" {
            return Err(EngineError::Validation(format!(
                "invalid register_type for write: {} (only 'holding' supported)",
                register_type
            )));
        }

        device.write_single_register(address, value).await?;

        let mut output = StepData::new();
        output.insert("success".to_string(), Value::Bool(true));
        output.insert("address".to_string(), serde_json::json!(address));
        output.insert("value".to_string(), serde_json::json!(value));
        Ok(output)
    }

    async fn execute_read_register(
        &self,
        device: Arc<dyn Device>,
        params: &StepData,
    ) -> EngineResult<StepData> {
        let register = string_param(params, "register")?;
        let value = device.read_register(register).await?;

        let mut output = StepData::new();
        output.insert("register".to_string(), Value::String(register.to_string()));
        output.insert("value".to_string(), value);
        Ok(output)
    }

    async fn execute_write_register(
        &self,
        device: Arc<dyn Device>,
        params: &StepData,
    ) -> EngineResult<StepData> {
        let register = string_param(params, "register")?;
        let value = params
            .get("value")
            .cloned()
            .ok_or_else(|| EngineError::Validation("missing value parameter".to_string()))?;

        device.write_register(register, value.clone()).await?;

        let mut output = StepData::new();
        output.insert("register".to_string(), Value::String(register.to_string()));
        output.insert("value".to_string(), value);
        output.insert("success".to_string(), Value::Bool(true));
        Ok(output)
    }

    async fn execute_read_logical(
        &self,
        device: Arc<dyn Device>,
        params: &StepData,
    ) -> EngineResult<StepData> {
        let register = string_param(params, "register")?;
        let value = device.read_logical(register).await?;

        let mut output = StepData::new();
        output.insert("register".to_string(), Value::String(register.to_string()));
        output.insert("value".to_string(), value);
        Ok(output)
    }

    async fn execute_write_logical(
        &self,
        device: Arc<dyn Device>,
        params: &StepData,
    ) -> EngineResult<StepData> {
        let register = string_param(params, "register")?;
        let value = params
            .get("value")
            .cloned()
            .ok_or_else(|| EngineError::Validation("missing value parameter".to_string()))?;

        device.write_logical(register, value.clone()).await?;

        let mut output = StepData::new();
        output.insert("register".to_string(), Value::String(register.to_string()));
        output.insert("value".to_string(), value);
        output.insert("success".to_string(), Value::Bool(true));
        Ok(output)
    }

    async fn execute_wait_step(
        &self,
        cancel: &CancellationToken,
        step: &Step,
        input: &StepData,
    ) -> EngineResult<StepData> {
        let duration = step
            .timeout
            .map(|t| t.as_duration())
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_WAIT);

        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(input.clone()),
        }
    }
}

fn string_param<'a>(params: &'a StepData, key: &str) -> EngineResult<&'a str> {
    params.get(key).and_then(Value::as_str).ok_or_else(|| {
        EngineError::Validation(format!("missing or invalid {} parameter", key))
    })
}

fn number_param(params: &StepData, key: &str) -> EngineResult<f64> {
    params.get(key).and_then(Value::as_f64).ok_or_else(|| {
        EngineError::Validation(format!("missing or invalid {} parameter", key))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::StepDuration;
    use crate::stubs::{StubDevice, StubDeviceManager};
    use serde_json::json;
    use std::time::Instant;

    fn make_executor_with(device: Arc<StubDevice>) -> StepExecutor {
        let manager = StubDeviceManager::new();
        manager.insert(device);
        StepExecutor::new(Arc::new(manager))
    }

    fn device_step(operation: &str, parameters: Value) -> Step {
        let parameters = match parameters {
            Value::Object(map) => Some(map),
            _ => None,
        };
        Step {
            number: "10".to_string(),
            name: format!("{} step", operation),
            step_type: StepType::Device,
            device_id: Some("D1".to_string()),
            operation: Some(operation.to_string()),
            parameters,
            workflow_id: None,
            condition: None,
            on_error: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_write_logical_output_shape() {
        let device = Arc::new(StubDevice::new("D1"));
        let executor = make_executor_with(device.clone());
        let step = device_step("write_logical", json!({"register": "LED", "value": true}));

        let output = executor
            .execute(&CancellationToken::new(), &step, &StepData::new())
            .await
            .unwrap();

        assert_eq!(output.get("register"), Some(&json!("LED")));
        assert_eq!(output.get("value"), Some(&json!(true)));
        assert_eq!(output.get("success"), Some(&json!(true)));
        assert_eq!(device.register_value("LED"), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_read_holding_with_count() {
        let device = Arc::new(StubDevice::new("D1"));
        device.set_holding(5, 11);
        device.set_holding(6, 22);
        let executor = make_executor_with(device);
        let step = device_step(
            "read",
            json!({"register_type": "holding", "address": 5, "count": 2}),
        );

        let output = executor
            .execute(&CancellationToken::new(), &step, &StepData::new())
            .await
            .unwrap();
        assert_eq!(output.get("values"), Some(&json!([11, 22])));
    }

    #[tokio::test]
    async fn test_write_requires_holding() {
        let executor = make_executor_with(Arc::new(StubDevice::new("D1")));
        let step = device_step(
            "write",
            json!({"register_type": "input", "address": 5, "value": 1}),
        );

        let err = executor
            .execute(&CancellationToken::new(), &step, &StepData::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("register_type"));
    }

    #[tokio::test]
    async fn test_missing_parameter_fails_the_step() {
        let executor = make_executor_with(Arc::new(StubDevice::new("D1")));
        let step = device_step("read", json!({"register_type": "holding"}));

        let err = executor
            .execute(&CancellationToken::new(), &step, &StepData::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("address"));
    }

    #[tokio::test]
    async fn test_input_overrides_step_parameters() {
        let device = Arc::new(StubDevice::new("D1"));
        let executor = make_executor_with(device.clone());
        let step = device_step("write_logical", json!({"register": "LED", "value": false}));

        let mut input = StepData::new();
        input.insert("value".to_string(), json!(true));

        let output = executor
            .execute(&CancellationToken::new(), &step, &input)
            .await
            .unwrap();
        assert_eq!(output.get("value"), Some(&json!(true)));
        assert_eq!(device.register_value("LED"), Some(json!(true)));
    }

    #[tokio::test]
    async fn test_unknown_device_fails() {
        let executor = make_executor_with(Arc::new(StubDevice::new("D1")));
        let mut step = device_step("read_logical", json!({"register": "X"}));
        step.device_id = Some("missing".to_string());

        let err = executor
            .execute(&CancellationToken::new(), &step, &StepData::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("device not found"));
    }

    #[tokio::test]
    async fn test_unsupported_operation() {
        let executor = make_executor_with(Arc::new(StubDevice::new("D1")));
        let step = device_step("calibrate", json!({}));

        let err = executor
            .execute(&CancellationToken::new(), &step, &StepData::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported operation"));
    }

    #[tokio::test]
    async fn test_wait_returns_input_unchanged() {
        let executor = make_executor_with(Arc::new(StubDevice::new("D1")));
        let step = Step {
            number: "10".to_string(),
            name: "settle".to_string(),
            step_type: StepType::Wait,
            device_id: None,
            operation: None,
            parameters: None,
            workflow_id: None,
            condition: None,
            on_error: None,
            timeout: Some(StepDuration(Duration::from_millis(20))),
        };

        let mut input = StepData::new();
        input.insert("carried".to_string(), json!(42));

        let started = Instant::now();
        let output = executor
            .execute(&CancellationToken::new(), &step, &input)
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(output, input);
    }

    #[tokio::test]
    async fn test_wait_honours_cancellation() {
        let executor = make_executor_with(Arc::new(StubDevice::new("D1")));
        let step = Step {
            number: "10".to_string(),
            name: "long wait".to_string(),
            step_type: StepType::Wait,
            device_id: None,
            operation: None,
            parameters: None,
            workflow_id: None,
            condition: None,
            on_error: None,
            timeout: Some(StepDuration(Duration::from_secs(10))),
        };

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };

        let started = Instant::now();
        let err = executor
            .execute(&cancel, &step, &StepData::new())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(1));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_workflow_step_is_rejected() {
        let executor = make_executor_with(Arc::new(StubDevice::new("D1")));
        let mut step = device_step("read", json!({}));
        step.step_type = StepType::Workflow;

        let err = executor
            .execute(&CancellationToken::new(), &step, &StepData::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Internal(_)));
    }
}
