//! FieldBridge: an industrial IoT gateway that polls Modbus RTU/TCP
//! devices, publishes readings over MQTT (or HTTP), and exposes a BLE
//! GATT interface for CRUD configuration of the device/register
//! inventory it maintains.
//!
//! The crate is organized by the nine collaborating components named
//! throughout the module docs as C1-C9: Configuration Store, Live
//! Observation Queue, Persistent Retry Queue, Network Supervisor,
//! Memory Supervisor, Modbus Poller, MQTT Publisher, BLE Command
//! Processor, and the Coordinator that assembles and runs all of them.

pub mod ble;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod memory;
pub mod modbus;
pub mod mqtt;
pub mod network;
pub mod queue;
pub mod settings;

pub use coordinator::{Collaborators, Coordinator};
pub use error::{Domain, GatewayError, Result, Severity};
