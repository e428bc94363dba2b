//! C6 — Modbus Poller: RTU and TCP field-device acquisition (spec
//! section 4.6). Frame/CRC handling is `tokio-modbus`/`tokio-serial`'s
//! job; this module owns transport selection, the per-device read/write
//! codec, and the polling schedule that feeds C2.

pub mod codec;
pub mod poller;
pub mod transport;

pub use poller::{run_rtu_poller, run_tcp_poller, write_register, DeviceHealth, HealthMap, PollerContext};
pub use transport::{DefaultTransportFactory, ModbusError, ModbusTransport, RtuTransport, TcpTransport, TransportFactory};
