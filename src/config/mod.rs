//! C1 — Configuration Store: the device/register inventory plus server
//! and logging configuration, persisted atomically and served from a
//! two-copy cache (spec section 4.1).

pub mod model;
pub mod store;
pub mod wal;

pub use model::{
    clamp_decimals, clamp_qos, generate_device_id, generate_register_id, CustomTopicEntry, CustomizeModeBlock,
    DataType, DefaultModeBlock, Device, DeviceConfigInput, DeviceId, DeviceInventory, DeviceView, Endianness,
    EthernetBlock, FunctionCode, HttpBlock, LoggingConfig, MqttBlock, MqttSubscribeOverride, NetworkMode, Parity,
    ProtocolKind, PublishMode, PublishProtocol, Register, RegisterConfigInput, RegisterId, ServerConfig,
    TransportParams, WifiCredentials, WritePolicy,
};
pub use store::{ConfigEvent, ConfigStore};
