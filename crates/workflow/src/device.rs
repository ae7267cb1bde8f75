//! Device interface consumed by the step executor.
//!
//! The Modbus TCP client, register maps and polling live outside this
//! crate; the executor only sees logical devices through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::EngineResult;

/// A single addressable device.
#[async_trait]
pub trait Device: Send + Sync {
    /// Logical instance name.
    fn name(&self) -> &str;

    /// Read `count` holding registers starting at `address`.
    async fn read_holding(&self, address: u16, count: u16) -> EngineResult<Vec<u16>>;

    /// Read `count` input registers starting at `address`.
    async fn read_input(&self, address: u16, count: u16) -> EngineResult<Vec<u16>>;

    /// Write a single holding register.
    async fn write_single_register(&self, address: u16, value: u16) -> EngineResult<()>;

    /// Read a named register from the device profile.
    async fn read_register(&self, register: &str) -> EngineResult<Value>;

    /// Write a named register from the device profile.
    async fn write_register(&self, register: &str, value: Value) -> EngineResult<()>;

    /// Read through the logical-name mapping.
    async fn read_logical(&self, name: &str) -> EngineResult<Value>;

    /// Write through the logical-name mapping.
    async fn write_logical(&self, name: &str, value: Value) -> EngineResult<()>;
}

/// Registry of devices by logical instance name.
pub trait DeviceManager: Send + Sync {
    fn get_device_by_name(&self, name: &str) -> Option<Arc<dyn Device>>;
}
