//! Workflow definition types.
//!
//! Definitions are authored as JSON and stored verbatim by the persistence
//! layer; these are the parsed, immutable forms the engine and validator
//! consume. Parsing only fails on structural JSON problems — semantic
//! checks (missing names, unknown devices, cycles) are the validator's job.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// A complete workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Human label used in call-stack rendering ("main", "sub_pick", ...).
    #[serde(default)]
    pub program_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<HashMap<String, String>>,
    #[serde(rename = "loop", default, skip_serializing_if = "Option::is_none")]
    pub loop_config: Option<LoopConfig>,
}

/// Whole-workflow looping directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Iteration bound; 0 means unbounded.
    #[serde(default)]
    pub max_count: i64,
    #[serde(default)]
    pub on_error: LoopErrorPolicy,
}

/// What a step error does to the surrounding loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopErrorPolicy {
    #[default]
    Stop,
    Continue,
}

/// A single unit of work inside a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Free-form label such as "10" or "30.1".
    #[serde(default)]
    pub number: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub step_type: StepType,

    // Device step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,

    // Sub-workflow step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    // Common
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_error: Option<ErrorStrategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<StepDuration>,
}

/// Step variant tag. Unrecognised values survive parsing so the validator
/// can report them instead of the parser rejecting the whole definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Device,
    Workflow,
    Wait,
    #[serde(untagged)]
    Other(String),
}

impl Default for StepType {
    fn default() -> Self {
        StepType::Other(String::new())
    }
}

impl fmt::Display for StepType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepType::Device => write!(f, "device"),
            StepType::Workflow => write!(f, "workflow"),
            StepType::Wait => write!(f, "wait"),
            StepType::Other(s) => write!(f, "{}", s),
        }
    }
}

/// Declared per-step error policy. Parsed and carried for round-tripping;
/// the base engine does not act on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorStrategy {
    Fail,
    Retry,
    Skip,
    Continue,
}

/// Step timeout accepting either a human string ("2s", "100ms", "1h30m")
/// or a raw number of nanoseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepDuration(pub Duration);

impl StepDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for StepDuration {
    fn from(d: Duration) -> Self {
        StepDuration(d)
    }
}

impl<'de> Deserialize<'de> for StepDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Number(n) => {
                let nanos = n
                    .as_f64()
                    .ok_or_else(|| serde::de::Error::custom("invalid duration number"))?;
                if nanos < 0.0 {
                    return Err(serde::de::Error::custom("duration must not be negative"));
                }
                Ok(StepDuration(Duration::from_nanos(nanos as u64)))
            }
            Value::String(s) => parse_duration(&s)
                .map(StepDuration)
                .map_err(serde::de::Error::custom),
            other => Err(serde::de::Error::custom(format!(
                "invalid duration type: {}",
                type_name(&other)
            ))),
        }
    }
}

impl Serialize for StepDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(self.0.as_nanos() as u64)
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parse a duration string of concatenated `<value><unit>` segments,
/// e.g. "2s", "100ms", "1h30m", "1.5s". Units: ns, us, ms, s, m, h.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    const UNITS: [(&str, f64); 7] = [
        ("ns", 1.0),
        ("us", 1e3),
        ("\u{b5}s", 1e3),
        ("ms", 1e6),
        ("s", 1e9),
        ("m", 60e9),
        ("h", 3600e9),
    ];

    let trimmed = s.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(|| format!("missing unit in duration '{}'", s))?;
        if digits_end == 0 {
            return Err(format!("invalid duration '{}'", s));
        }
        let value: f64 = rest[..digits_end]
            .parse()
            .map_err(|_| format!("invalid number in duration '{}'", s))?;

        let unit_rest = &rest[digits_end..];
        let mut matched = None;
        for (unit, nanos_per) in UNITS {
            if let Some(next) = unit_rest.strip_prefix(unit) {
                matched = Some((value * nanos_per, next));
                break;
            }
        }
        let (nanos, next) =
            matched.ok_or_else(|| format!("unknown unit in duration '{}'", s))?;
        total += Duration::from_nanos(nanos as u64);
        rest = next;
    }
    Ok(total)
}

/// A single level of an execution call stack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallFrame {
    pub workflow_id: String,
    pub program_name: String,
    pub step_number: String,
}

/// Render the hierarchical step id for a call stack, root first.
/// Example: "main:S10:sub_pick:S20". An empty stack renders empty.
pub fn build_hierarchical_step_id(call_stack: &[CallFrame]) -> String {
    let mut parts = Vec::with_capacity(call_stack.len() * 2);
    for frame in call_stack {
        parts.push(frame.program_name.clone());
        parts.push(format!("S{}", frame.step_number));
    }
    parts.join(":")
}
