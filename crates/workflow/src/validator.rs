//! Static analysis of workflow definitions.
//!
//! Validates a workflow and every workflow reachable through its
//! sub-workflow steps, producing a deterministic, sorted report. The
//! traversal is a depth-first walk with three per-node states (not yet
//! visited, visiting, done), which doubles as the cycle detector.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::definition::{self, Step, StepType, Workflow};
use crate::error::EngineResult;
use crate::storage::Storage;

/// Issue severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// A single validation finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Issue {
    pub code: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub step_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub field: String,
    /// JSON-pointer-style location ("/steps/0/device_id").
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl Issue {
    fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Error, message)
    }

    fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(code, Severity::Warning, message)
    }

    fn new(code: &str, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            severity,
            message: message.into(),
            workflow_id: String::new(),
            step_name: String::new(),
            field: String::new(),
            path: String::new(),
            hint: String::new(),
            meta: None,
        }
    }

    fn workflow(mut self, id: Uuid) -> Self {
        self.workflow_id = id.to_string();
        self
    }

    fn step(mut self, name: &str) -> Self {
        self.step_name = name.to_string();
        self
    }

    fn field(mut self, field: &str) -> Self {
        self.field = field.to_string();
        self
    }

    fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    fn hint(mut self, hint: &str) -> Self {
        self.hint = hint.to_string();
        self
    }

    fn meta(mut self, meta: serde_json::Value) -> Self {
        self.meta = Some(meta);
        self
    }
}

/// Validation result. `valid` iff the error list is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Report {
    pub valid: bool,
    pub errors: Vec<Issue>,
    pub warnings: Vec<Issue>,
}

impl Report {
    fn add_error(&mut self, issue: Issue) {
        self.errors.push(issue);
    }

    fn add_warning(&mut self, issue: Issue) {
        self.warnings.push(issue);
    }

    fn finalize(&mut self) {
        sort_issues(&mut self.errors);
        sort_issues(&mut self.warnings);
        self.valid = self.errors.is_empty();
    }
}

fn sort_issues(list: &mut [Issue]) {
    list.sort_by(|a, b| {
        a.workflow_id
            .cmp(&b.workflow_id)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.code.cmp(&b.code))
            .then_with(|| a.message.cmp(&b.message))
    });
}

/// Static workflow validator.
pub struct Validator {
    storage: Arc<dyn Storage>,
}

impl Validator {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Validate a stored workflow and all reachable sub-workflows.
    ///
    /// Top-level load failures return `Err`; definition and semantic
    /// problems land in the report.
    pub async fn validate_by_id(&self, workflow_id: Uuid) -> EngineResult<Report> {
        let mut report = Report::default();

        let record = self.storage.load_workflow(workflow_id).await?;
        let workflow = match definition::parse_workflow(&record.definition) {
            Ok(workflow) => workflow,
            Err(err) => {
                report.add_error(
                    Issue::error(
                        "WORKFLOW_900",
                        format!("Workflow definition JSON invalid: {}", err),
                    )
                    .workflow(workflow_id)
                    .field("definition")
                    .path("/definition"),
                );
                report.finalize();
                return Ok(report);
            }
        };

        let mut walk = WalkState {
            storage: Arc::clone(&self.storage),
            cache: HashMap::from([(workflow_id, workflow)]),
            visiting: HashSet::new(),
            done: HashSet::new(),
            stack: Vec::new(),
            report,
        };
        walk.walk(workflow_id).await;

        let mut report = walk.report;
        report.finalize();
        Ok(report)
    }
}

enum Fetched {
    Found(Workflow),
    Missing,
    /// Definition invalid; the WORKFLOW_900 issue is already recorded.
    Invalid,
}

struct WalkState {
    storage: Arc<dyn Storage>,
    cache: HashMap<Uuid, Workflow>,
    visiting: HashSet<Uuid>,
    done: HashSet<Uuid>,
    /// Ids on the current path, root first.
    stack: Vec<Uuid>,
    report: Report,
}

impl WalkState {
    async fn walk(&mut self, workflow_id: Uuid) {
        if self.done.contains(&workflow_id) {
            return;
        }
        if self.visiting.contains(&workflow_id) {
            self.report.add_error(
                Issue::error("WORKFLOW_050", "Circular workflow reference detected")
                    .workflow(workflow_id),
            );
            return;
        }

        let workflow = match self.get_workflow(workflow_id).await {
            Ok(Fetched::Found(workflow)) => workflow,
            Ok(Fetched::Missing) => {
                self.report.add_error(
                    Issue::error("WORKFLOW_003", "Referenced workflow not found")
                        .workflow(workflow_id),
                );
                self.done.insert(workflow_id);
                return;
            }
            Ok(Fetched::Invalid) => {
                self.done.insert(workflow_id);
                return;
            }
            Err(err) => {
                self.report.add_error(
                    Issue::error("WORKFLOW_901", format!("Failed to load workflow: {}", err))
                        .workflow(workflow_id),
                );
                self.done.insert(workflow_id);
                return;
            }
        };

        self.visiting.insert(workflow_id);
        self.stack.push(workflow_id);

        self.validate_workflow(workflow_id, &workflow).await;

        self.stack.pop();
        self.visiting.remove(&workflow_id);
        self.done.insert(workflow_id);
    }

    async fn get_workflow(&mut self, workflow_id: Uuid) -> EngineResult<Fetched> {
        if let Some(workflow) = self.cache.get(&workflow_id) {
            return Ok(Fetched::Found(workflow.clone()));
        }

        if !self.storage.workflow_exists(workflow_id).await? {
            return Ok(Fetched::Missing);
        }

        let record = self.storage.load_workflow(workflow_id).await?;
        match definition::parse_workflow(&record.definition) {
            Ok(workflow) => {
                self.cache.insert(workflow_id, workflow.clone());
                Ok(Fetched::Found(workflow))
            }
            Err(err) => {
                self.report.add_error(
                    Issue::error(
                        "WORKFLOW_900",
                        format!("Workflow definition JSON invalid: {}", err),
                    )
                    .workflow(workflow_id)
                    .field("definition")
                    .path("/definition"),
                );
                Ok(Fetched::Invalid)
            }
        }
    }

    async fn validate_workflow(&mut self, workflow_id: Uuid, workflow: &Workflow) {
        if workflow.name.trim().is_empty() {
            self.report.add_error(
                Issue::error("WORKFLOW_001", "Workflow name is required")
                    .workflow(workflow_id)
                    .field("name")
                    .path("/name"),
            );
        }
        if workflow.version.trim().is_empty() {
            self.report.add_warning(
                Issue::warning("WORKFLOW_002", "Workflow version is empty")
                    .workflow(workflow_id)
                    .field("version")
                    .path("/version"),
            );
        }
        if workflow.steps.is_empty() {
            self.report.add_error(
                Issue::error("WORKFLOW_004", "Workflow has no steps")
                    .workflow(workflow_id)
                    .field("steps")
                    .path("/steps"),
            );
            return;
        }
        if let Some(loop_config) = &workflow.loop_config {
            if loop_config.enabled && loop_config.max_count < 0 {
                self.report.add_error(
                    Issue::error("WORKFLOW_005", "loop.max_count must be >= 0")
                        .workflow(workflow_id)
                        .field("loop.max_count")
                        .path("/loop/max_count"),
                );
            }
        }

        for (index, step) in workflow.steps.iter().enumerate() {
            let base = format!("/steps/{}", index);

            if step.name.trim().is_empty() {
                self.report.add_error(
                    Issue::error("STEP_001", "Step name is required")
                        .workflow(workflow_id)
                        .field("name")
                        .path(format!("{}/name", base))
                        .meta(json!({ "step_index": index })),
                );
            }

            match &step.step_type {
                StepType::Device => {
                    self.validate_device_step(workflow_id, step, index, &base).await;
                }
                StepType::Workflow => {
                    self.validate_sub_workflow_step(workflow_id, step, index, &base)
                        .await;
                }
                StepType::Wait => {}
                StepType::Other(other) => {
                    self.report.add_error(
                        Issue::error("STEP_002", format!("Unsupported step type: {}", other))
                            .workflow(workflow_id)
                            .field("type")
                            .path(format!("{}/type", base))
                            .meta(json!({ "step_index": index })),
                    );
                }
            }
        }
    }

    async fn validate_device_step(
        &mut self,
        workflow_id: Uuid,
        step: &Step,
        index: usize,
        base: &str,
    ) {
        let device_id = step.device_id.as_deref().unwrap_or_default();

        if device_id.trim().is_empty() {
            self.report.add_error(
                Issue::error("DEVICE_010", "device_id is required for device step")
                    .workflow(workflow_id)
                    .step(&step.name)
                    .field("device_id")
                    .path(format!("{}/device_id", base))
                    .meta(json!({ "step_index": index })),
            );
        } else {
            match self.storage.device_exists_enabled_by_name(device_id).await {
                Err(err) => {
                    self.report.add_error(
                        Issue::error("DEVICE_999", format!("Device lookup failed: {}", err))
                            .workflow(workflow_id)
                            .step(&step.name)
                            .field("device_id")
                            .path(format!("{}/device_id", base))
                            .meta(json!({ "step_index": index })),
                    );
                }
                Ok((false, _)) => {
                    self.report.add_error(
                        Issue::error("DEVICE_001", format!("Device not found: {}", device_id))
                            .workflow(workflow_id)
                            .step(&step.name)
                            .field("device_id")
                            .path(format!("{}/device_id", base))
                            .meta(json!({ "step_index": index })),
                    );
                }
                Ok((true, false)) => {
                    self.report.add_error(
                        Issue::error("DEVICE_002", format!("Device is disabled: {}", device_id))
                            .workflow(workflow_id)
                            .step(&step.name)
                            .field("device_id")
                            .path(format!("{}/device_id", base))
                            .meta(json!({ "step_index": index })),
                    );
                }
                Ok((true, true)) => {}
            }
        }

        let operation = step.operation.as_deref().unwrap_or_default().trim();
        if operation.is_empty() {
            self.report.add_error(
                Issue::error("DEVICE_011", "operation is required for device step")
                    .workflow(workflow_id)
                    .step(&step.name)
                    .field("operation")
                    .path(format!("{}/operation", base))
                    .meta(json!({ "step_index": index })),
            );
            return;
        }

        let Some(required) = required_params_for_op(operation) else {
            self.report.add_error(
                Issue::error("DEVICE_012", format!("Unsupported operation: {}", operation))
                    .workflow(workflow_id)
                    .step(&step.name)
                    .field("operation")
                    .path(format!("{}/operation", base))
                    .meta(json!({ "step_index": index })),
            );
            return;
        };

        // Parameter presence is a warning: values may arrive in the
        // execution input instead.
        for param in required {
            let missing = match &step.parameters {
                None => true,
                Some(params) => !params.contains_key(*param),
            };
            if missing {
                let message = if step.parameters.is_none() {
                    format!("Missing parameter '{}' (step.parameters is empty)", param)
                } else {
                    format!("Missing parameter '{}'", param)
                };
                self.report.add_warning(
                    Issue::warning("DEVICE_020", message)
                        .workflow(workflow_id)
                        .step(&step.name)
                        .field(&format!("parameters.{}", param))
                        .path(format!("{}/parameters", base))
                        .hint("Define it in step.parameters or provide it in the execution input")
                        .meta(json!({ "step_index": index, "param": param })),
                );
            }
        }

        if let Some(params) = &step.parameters {
            if operation == "read" || operation == "write" {
                if let Some(register_type) = params.get("register_type").and_then(|v| v.as_str()) {
                    if register_type != "holding" && register_type != "input" {
                        self.report.add_error(
                            Issue::error(
                                "DEVICE_021",
                                format!("Invalid register_type: {}", register_type),
                            )
                            .workflow(workflow_id)
                            .step(&step.name)
                            .field("parameters.register_type")
                            .path(format!("{}/parameters/register_type", base))
                            .meta(json!({ "step_index": index })),
                        );
                    }
                }
            }
        }
    }

    async fn validate_sub_workflow_step(
        &mut self,
        workflow_id: Uuid,
        step: &Step,
        index: usize,
        base: &str,
    ) {
        let raw_id = step.workflow_id.as_deref().unwrap_or_default();

        if raw_id.trim().is_empty() {
            self.report.add_error(
                Issue::error("WORKFLOW_010", "workflow_id is required for workflow step")
                    .workflow(workflow_id)
                    .step(&step.name)
                    .field("workflow_id")
                    .path(format!("{}/workflow_id", base))
                    .meta(json!({ "step_index": index })),
            );
            return;
        }

        let sub_id = match Uuid::parse_str(raw_id) {
            Ok(sub_id) => sub_id,
            Err(err) => {
                self.report.add_error(
                    Issue::error("WORKFLOW_011", format!("Invalid workflow_id: {}", err))
                        .workflow(workflow_id)
                        .step(&step.name)
                        .field("workflow_id")
                        .path(format!("{}/workflow_id", base))
                        .meta(json!({ "step_index": index })),
                );
                return;
            }
        };

        let exists = match self.storage.workflow_exists(sub_id).await {
            Ok(exists) => exists,
            Err(err) => {
                self.report.add_error(
                    Issue::error("WORKFLOW_999", format!("Workflow lookup failed: {}", err))
                        .workflow(workflow_id)
                        .step(&step.name)
                        .field("workflow_id")
                        .path(format!("{}/workflow_id", base))
                        .meta(json!({ "step_index": index })),
                );
                return;
            }
        };
        if !exists {
            self.report.add_error(
                Issue::error(
                    "WORKFLOW_003",
                    format!("Referenced workflow not found: {}", sub_id),
                )
                .workflow(workflow_id)
                .step(&step.name)
                .field("workflow_id")
                .path(format!("{}/workflow_id", base))
                .meta(json!({ "step_index": index })),
            );
            return;
        }

        // Cycle: the referenced workflow is already on the current path.
        if self.visiting.contains(&sub_id) {
            self.report.add_error(
                Issue::error("WORKFLOW_050", "Circular workflow reference detected")
                    .workflow(workflow_id)
                    .step(&step.name)
                    .field("workflow_id")
                    .path(format!("{}/workflow_id", base))
                    .meta(json!({
                        "step_index": index,
                        "cycle": self.cycle_path(sub_id),
                    })),
            );
            return;
        }

        Box::pin(self.walk(sub_id)).await;
    }

    /// Id path from the cycle's start back to the target, as strings.
    fn cycle_path(&self, target: Uuid) -> Vec<String> {
        let start = match self.stack.iter().position(|id| *id == target) {
            Some(start) => start,
            None => return vec![target.to_string()],
        };

        let mut path: Vec<String> = self.stack[start..]
            .iter()
            .map(|id| id.to_string())
            .collect();
        path.push(target.to_string());
        path
    }
}

fn required_params_for_op(operation: &str) -> Option<&'static [&'static str]> {
    match operation {
        "read" => Some(&["register_type", "address"]),
        "write" => Some(&["register_type", "address", "value"]),
        "read_logical" | "read_register" => Some(&["register"]),
        "write_logical" | "write_register" => Some(&["register", "value"]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stubs::InMemoryStorage;
    use serde_json::json;

    fn make_validator(storage: Arc<InMemoryStorage>) -> Validator {
        Validator::new(storage as Arc<dyn Storage>)
    }

    fn codes(issues: &[Issue]) -> Vec<&str> {
        issues.iter().map(|i| i.code.as_str()).collect()
    }

    #[tokio::test]
    async fn test_valid_workflow_passes() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.insert_device("D1", true);
        let workflow_id = Uuid::new_v4();
        storage.insert_workflow(
            workflow_id,
            "ok",
            json!({
                "name": "ok",
                "program_name": "main",
                "version": "1",
                "steps": [{
                    "number": "10",
                    "name": "toggle",
                    "type": "device",
                    "device_id": "D1",
                    "operation": "write_logical",
                    "parameters": {"register": "LED", "value": true}
                }]
            }),
        );

        let report = make_validator(storage)
            .validate_by_id(workflow_id)
            .await
            .unwrap();
        assert!(report.valid, "unexpected errors: {:?}", report.errors);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_missing_value_is_a_warning_not_an_error() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.insert_device("D1", true);
        let workflow_id = Uuid::new_v4();
        storage.insert_workflow(
            workflow_id,
            "partial write",
            json!({
                "name": "partial write",
                "program_name": "main",
                "version": "1",
                "steps": [{
                    "number": "10",
                    "name": "write",
                    "type": "device",
                    "device_id": "D1",
                    "operation": "write",
                    "parameters": {"register_type": "holding", "address": 10}
                }]
            }),
        );

        let report = make_validator(storage)
            .validate_by_id(workflow_id)
            .await
            .unwrap();
        assert!(report.valid);
        assert!(report.errors.is_empty());
        assert_eq!(codes(&report.warnings), vec!["DEVICE_020"]);
        assert_eq!(report.warnings[0].field, "parameters.value");
    }

    #[tokio::test]
    async fn test_cycle_detection() {
        let storage = Arc::new(InMemoryStorage::new());
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        storage.insert_workflow(
            a,
            "a",
            json!({
                "name": "a",
                "program_name": "a",
                "version": "1",
                "steps": [{"number": "10", "name": "call b", "type": "workflow", "workflow_id": b.to_string()}]
            }),
        );
        storage.insert_workflow(
            b,
            "b",
            json!({
                "name": "b",
                "program_name": "b",
                "version": "1",
                "steps": [{"number": "10", "name": "call a", "type": "workflow", "workflow_id": a.to_string()}]
            }),
        );

        let report = make_validator(storage).validate_by_id(a).await.unwrap();
        assert!(!report.valid);

        let cycles: Vec<&Issue> = report
            .errors
            .iter()
            .filter(|i| i.code == "WORKFLOW_050")
            .collect();
        assert_eq!(cycles.len(), 1);

        let meta = cycles[0].meta.as_ref().unwrap();
        let cycle: Vec<String> =
            serde_json::from_value(meta.get("cycle").cloned().unwrap()).unwrap();
        assert_eq!(cycle, vec![a.to_string(), b.to_string(), a.to_string()]);
    }

    #[tokio::test]
    async fn test_structural_checks() {
        let storage = Arc::new(InMemoryStorage::new());
        let workflow_id = Uuid::new_v4();
        storage.insert_workflow(workflow_id, "anonymous", json!({"steps": []}));

        let report = make_validator(storage)
            .validate_by_id(workflow_id)
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(codes(&report.errors), vec!["WORKFLOW_001", "WORKFLOW_004"]);
        assert_eq!(codes(&report.warnings), vec!["WORKFLOW_002"]);
    }

    #[tokio::test]
    async fn test_unknown_step_type_and_missing_name() {
        let storage = Arc::new(InMemoryStorage::new());
        let workflow_id = Uuid::new_v4();
        storage.insert_workflow(
            workflow_id,
            "odd",
            json!({
                "name": "odd",
                "program_name": "main",
                "version": "1",
                "steps": [{"number": "10", "type": "teleport"}]
            }),
        );

        let report = make_validator(storage)
            .validate_by_id(workflow_id)
            .await
            .unwrap();
        assert_eq!(codes(&report.errors), vec!["STEP_001", "STEP_002"]);
        assert!(report.errors[1].message.contains("teleport"));
    }

    #[tokio::test]
    async fn test_device_checks() {
        let storage = Arc::new(InMemoryStorage::new());
        storage.insert_device("disabled", false);
        let workflow_id = Uuid::new_v4();
        storage.insert_workflow(
            workflow_id,
            "devices",
            json!({
                "name": "devices",
                "program_name": "main",
                "version": "1",
                "steps": [
                    {"number": "10", "name": "no device", "type": "device", "operation": "read_logical", "parameters": {"register": "X"}},
                    {"number": "20", "name": "ghost", "type": "device", "device_id": "ghost", "operation": "read_logical", "parameters": {"register": "X"}},
                    {"number": "30", "name": "off", "type": "device", "device_id": "disabled", "operation": "read_logical", "parameters": {"register": "X"}},
                    {"number": "40", "name": "no op", "type": "device", "device_id": "disabled"},
                    {"number": "50", "name": "bad op", "type": "device", "device_id": "disabled", "operation": "levitate"},
                    {"number": "60", "name": "bad register type", "type": "device", "device_id": "disabled", "operation": "read", "parameters": {"register_type": "coil", "address": 1}}
                ]
            }),
        );

        let report = make_validator(storage)
            .validate_by_id(workflow_id)
            .await
            .unwrap();
        let error_codes = codes(&report.errors);
        assert!(error_codes.contains(&"DEVICE_010"));
        assert!(error_codes.contains(&"DEVICE_001"));
        assert!(error_codes.contains(&"DEVICE_002"));
        assert!(error_codes.contains(&"DEVICE_011"));
        assert!(error_codes.contains(&"DEVICE_012"));
        assert!(error_codes.contains(&"DEVICE_021"));
    }

    #[tokio::test]
    async fn test_sub_workflow_reference_checks() {
        let storage = Arc::new(InMemoryStorage::new());
        let workflow_id = Uuid::new_v4();
        storage.insert_workflow(
            workflow_id,
            "refs",
            json!({
                "name": "refs",
                "program_name": "main",
                "version": "1",
                "steps": [
                    {"number": "10", "name": "no id", "type": "workflow"},
                    {"number": "20", "name": "mangled", "type": "workflow", "workflow_id": "not-a-uuid"},
                    {"number": "30", "name": "ghost", "type": "workflow", "workflow_id": Uuid::new_v4().to_string()}
                ]
            }),
        );

        let report = make_validator(storage)
            .validate_by_id(workflow_id)
            .await
            .unwrap();
        assert_eq!(
            codes(&report.errors),
            vec!["WORKFLOW_010", "WORKFLOW_011", "WORKFLOW_003"]
        );
    }

    #[tokio::test]
    async fn test_repeated_references_validate_once() {
        let storage = Arc::new(InMemoryStorage::new());
        let shared = Uuid::new_v4();
        // Missing name in the shared workflow: the issue must appear once
        // even though it is referenced twice.
        storage.insert_workflow(
            shared,
            "shared",
            json!({
                "program_name": "shared",
                "version": "1",
                "steps": [{"number": "10", "name": "pause", "type": "wait"}]
            }),
        );
        let workflow_id = Uuid::new_v4();
        storage.insert_workflow(
            workflow_id,
            "caller",
            json!({
                "name": "caller",
                "program_name": "main",
                "version": "1",
                "steps": [
                    {"number": "10", "name": "first call", "type": "workflow", "workflow_id": shared.to_string()},
                    {"number": "20", "name": "second call", "type": "workflow", "workflow_id": shared.to_string()}
                ]
            }),
        );

        let report = make_validator(storage)
            .validate_by_id(workflow_id)
            .await
            .unwrap();
        assert_eq!(codes(&report.errors), vec!["WORKFLOW_001"]);
    }

    #[tokio::test]
    async fn test_report_is_deterministic() {
        let storage = Arc::new(InMemoryStorage::new());
        let workflow_id = Uuid::new_v4();
        storage.insert_workflow(
            workflow_id,
            "messy",
            json!({
                "version": "",
                "steps": [
                    {"number": "10", "type": "teleport"},
                    {"number": "20", "name": "no device", "type": "device"}
                ]
            }),
        );

        let validator = make_validator(storage);
        let first = validator.validate_by_id(workflow_id).await.unwrap();
        let second = validator.validate_by_id(workflow_id).await.unwrap();

        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_top_level_load_failure_is_an_error() {
        let storage = Arc::new(InMemoryStorage::new());
        let result = make_validator(storage).validate_by_id(Uuid::new_v4()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_definition_goes_into_the_report() {
        let storage = Arc::new(InMemoryStorage::new());
        let workflow_id = Uuid::new_v4();
        storage.insert_workflow(workflow_id, "broken", json!("not an object"));

        let report = make_validator(storage)
            .validate_by_id(workflow_id)
            .await
            .unwrap();
        assert!(!report.valid);
        assert_eq!(codes(&report.errors), vec!["WORKFLOW_900"]);
    }
}
