//! Machina Workflow Core
//!
//! The execution heart of the machina machine-control backend:
//!
//! - **Workflow Engine**: asynchronous executor of JSON workflow
//!   definitions, producing a durable, hierarchical record of every step
//!   and streaming live events to subscribers
//! - **Validator**: static analysis of a workflow and every reachable
//!   sub-workflow, including cycle detection
//! - **Event Streamer**: bounded pub/sub fan-out of per-execution events
//! - **Execution Tracker**: per-execution call stack shared with observers
//!
//! ## Architecture
//!
//! Each execution is owned by exactly one runner task with its own
//! cancellation scope, rooted independently of the caller so executions
//! outlive the requests that launch them. Persistence and device access
//! are collaborators reached through the [`storage::Storage`] and
//! [`device::Device`] traits; transports sit above this crate.
//!
//! ## Modules
//!
//! - [`definition`]: parsed workflow/step types and call-stack rendering
//! - [`engine`]: execution ownership, runner loop, sub-workflow expansion
//! - [`executor`]: stateless device and wait step evaluation
//! - [`streaming`]: per-execution event fan-out
//! - [`validator`]: static analysis with a fixed issue catalogue
//! - [`stubs`]: in-memory collaborators for tests and local wiring

pub mod definition;
pub mod device;
pub mod engine;
pub mod error;
pub mod executor;
pub mod storage;
pub mod streaming;
pub mod stubs;
pub mod tracker;
pub mod validator;

pub use engine::WorkflowEngine;
pub use error::{EngineError, EngineResult};
pub use executor::{StepData, StepExecutor};
pub use streaming::EventStreamer;
pub use tracker::ExecutionTracker;
pub use validator::Validator;
