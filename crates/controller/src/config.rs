//! Machine controller configuration.

use std::time::Duration;

use uuid::Uuid;

use crate::error::{MachineError, MachineResult};

/// Machine controller configuration.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// Workflow executed by the `stop` command.
    pub stop_workflow_id: Option<Uuid>,

    /// Workflow executed by the `home` command.
    pub home_workflow_id: Option<Uuid>,

    /// Workflow executed by the `start` command.
    pub production_workflow_id: Option<Uuid>,

    /// Observer poll interval.
    pub poll_interval: Duration,
}

impl MachineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> MachineResult<Self> {
        let poll_ms: u64 = std::env::var("MACHINE_POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(100);

        Ok(Self {
            stop_workflow_id: workflow_id_from_env("MACHINE_STOP_WORKFLOW_ID")?,
            home_workflow_id: workflow_id_from_env("MACHINE_HOME_WORKFLOW_ID")?,
            production_workflow_id: workflow_id_from_env("MACHINE_PRODUCTION_WORKFLOW_ID")?,
            poll_interval: Duration::from_millis(poll_ms),
        })
    }
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            stop_workflow_id: None,
            home_workflow_id: None,
            production_workflow_id: None,
            poll_interval: Duration::from_millis(100),
        }
    }
}

fn workflow_id_from_env(key: &str) -> MachineResult<Option<Uuid>> {
    match std::env::var(key) {
        Ok(raw) => Uuid::parse_str(&raw)
            .map(Some)
            .map_err(|e| MachineError::Config(format!("{}: {}", key, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = MachineConfig::default();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert!(config.stop_workflow_id.is_none());
    }
}
