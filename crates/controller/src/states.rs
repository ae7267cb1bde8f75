//! Machine states, commands and status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operating state of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    Stopped,
    Homing,
    Ready,
    Running,
    Stopping,
    Error,
    Emergency,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Homing => write!(f, "homing"),
            Self::Ready => write!(f, "ready"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Error => write!(f, "error"),
            Self::Emergency => write!(f, "emergency"),
        }
    }
}

/// Operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineCommand {
    Home,
    Start,
    Stop,
    Reset,
}

impl std::fmt::Display for MachineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Home => write!(f, "home"),
            Self::Start => write!(f, "start"),
            Self::Stop => write!(f, "stop"),
            Self::Reset => write!(f, "reset"),
        }
    }
}

/// Snapshot of the controller's externally visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineStatus {
    pub state: MachineState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub production_cycles: u64,
    pub last_state_change: DateTime<Utc>,
}
