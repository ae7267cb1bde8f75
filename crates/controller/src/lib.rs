//! Machina Machine Controller
//!
//! High-level state machine over the workflow engine. Operator commands
//! (`home`, `start`, `stop`, `reset`) map onto three configured workflows;
//! observer tasks watch the resulting executions and advance the machine
//! state. The controller never touches devices directly — everything goes
//! through workflow executions.
//!
//! ## Modules
//!
//! - [`config`]: environment-based configuration
//! - [`controller`]: command handling and observer loops
//! - [`states`]: machine states, commands and the status snapshot

pub mod config;
pub mod controller;
pub mod error;
pub mod states;

pub use config::MachineConfig;
pub use controller::MachineController;
pub use error::{MachineError, MachineResult};
pub use states::{MachineCommand, MachineState, MachineStatus};
