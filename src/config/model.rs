//! Persistent data model for the Configuration Store (C1): Device,
//! Register, ServerConfig, LoggingConfig and their id types (spec
//! section 3).

use crate::error::GatewayError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque short random hex id. Never reused once assigned (spec section 3
/// invariant), enforced by the store checking against the full id set
/// (including deleted ids, tracked in the WAL/tombstone ledger) before
/// accepting a freshly generated one.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub String);

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn random_hex_id(bytes: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..bytes).map(|_| format!("{:02x}", rng.gen::<u8>())).collect()
}

pub fn generate_device_id() -> DeviceId {
    DeviceId(random_hex_id(4))
}

pub fn generate_register_id() -> RegisterId {
    RegisterId(random_hex_id(3))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Rtu,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum TransportParams {
    Rtu {
        serial_port_index: u8,
        baud: u32,
        parity: Parity,
        stop_bits: u8,
    },
    Tcp {
        address: std::net::Ipv4Addr,
        port: u16,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Even,
    Odd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionCode {
    ReadCoils = 1,
    ReadDiscreteInputs = 2,
    ReadHoldingRegisters = 3,
    ReadInputRegisters = 4,
}

impl FunctionCode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::ReadCoils),
            2 => Some(Self::ReadDiscreteInputs),
            3 => Some(Self::ReadHoldingRegisters),
            4 => Some(Self::ReadInputRegisters),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Endianness {
    Be,
    Le,
    BeByteSwap,
    LeWordSwap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DataType {
    U16,
    I16,
    Bool,
    U32 { endian: Endianness },
    I32 { endian: Endianness },
    U64 { endian: Endianness },
    I64 { endian: Endianness },
    F32 { endian: Endianness },
    F64 { endian: Endianness },
}

impl DataType {
    /// Number of 16-bit registers this type spans.
    pub fn register_span(&self) -> u16 {
        match self {
            DataType::U16 | DataType::I16 | DataType::Bool => 1,
            DataType::U32 { .. } | DataType::I32 { .. } | DataType::F32 { .. } => 2,
            DataType::U64 { .. } | DataType::I64 { .. } | DataType::F64 { .. } => 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WritePolicy {
    pub writable: bool,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self { writable: false, min_value: None, max_value: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MqttSubscribeOverride {
    pub enabled: bool,
    pub topic_suffix: String,
    pub qos: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Register {
    pub register_id: RegisterId,
    pub register_index: u32,
    pub name: String,
    pub address: u16,
    pub function_code: FunctionCode,
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub offset: f64,
    /// -1 = auto, 0..6 = fixed decimals.
    #[serde(default = "default_decimals")]
    pub decimals: i8,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub write_policy: Option<WritePolicy>,
    #[serde(default)]
    pub mqtt_override: Option<MqttSubscribeOverride>,
}

fn default_scale() -> f64 {
    1.0
}

fn default_decimals() -> i8 {
    -1
}

/// Clamp decimals into -1..=6 (spec section 8 boundary property).
pub fn clamp_decimals(decimals: i8) -> i8 {
    decimals.clamp(-1, 6)
}

/// Clamp qos into 0..=2 (spec section 8 boundary property).
pub fn clamp_qos(qos: i16) -> u8 {
    qos.clamp(0, 2) as u8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub name: String,
    pub protocol: ProtocolKind,
    pub transport: TransportParams,
    pub unit_id: u8,
    pub refresh_period_ms: u64,
    pub timeout_ms: u64,
    pub retry_count: u8,
    pub enabled: bool,
    pub registers: Vec<Register>,
}

impl Device {
    pub fn minimal_view(&self) -> DeviceView {
        DeviceView {
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            protocol: self.protocol,
            transport: self.transport.clone(),
            unit_id: self.unit_id,
            refresh_period_ms: self.refresh_period_ms,
            timeout_ms: self.timeout_ms,
            retry_count: self.retry_count,
            enabled: self.enabled,
            registers: None,
            register_count: Some(self.registers.len()),
        }
    }

    pub fn full_view(&self) -> DeviceView {
        DeviceView {
            registers: Some(self.registers.clone()),
            register_count: None,
            ..self.minimal_view()
        }
    }

    /// Re-derive `register_index` as 1-based position, called after any
    /// mutation that adds/removes registers (spec section 3).
    pub fn renumber_registers(&mut self) {
        for (idx, reg) in self.registers.iter_mut().enumerate() {
            reg.register_index = (idx + 1) as u32;
        }
    }

    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.name.trim().is_empty() {
            return Err(GatewayError::invalid_config("device name is required"));
        }
        let mut addrs = std::collections::HashSet::new();
        for reg in &self.registers {
            if !addrs.insert(reg.address) {
                return Err(GatewayError::duplicate_address(format!(
                    "duplicate register address {} on device {}",
                    reg.address, self.device_id
                )));
            }
        }
        Ok(())
    }
}

/// Response shape for reads: `minimal` omits `registers` and substitutes
/// `register_count` (spec section 4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceView {
    pub device_id: DeviceId,
    pub name: String,
    pub protocol: ProtocolKind,
    pub transport: TransportParams,
    pub unit_id: u8,
    pub refresh_period_ms: u64,
    pub timeout_ms: u64,
    pub retry_count: u8,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registers: Option<Vec<Register>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub register_count: Option<usize>,
}

/// Input shape for create/update — same fields as [`Device`] minus
/// `device_id` (always generated by the store, never caller-supplied;
/// spec section 9 design note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfigInput {
    pub name: String,
    pub protocol: ProtocolKind,
    pub transport: TransportParams,
    pub unit_id: u8,
    pub refresh_period_ms: u64,
    pub timeout_ms: u64,
    pub retry_count: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterConfigInput {
    pub name: String,
    pub address: u16,
    pub function_code: FunctionCode,
    pub data_type: DataType,
    pub scale: Option<f64>,
    pub offset: Option<f64>,
    pub decimals: Option<i8>,
    pub unit: Option<String>,
    pub write_policy: Option<WritePolicy>,
    pub mqtt_override: Option<MqttSubscribeOverride>,
}

/// The on-disk shape of `/devices.json`: a map from id to device.
pub type DeviceInventory = BTreeMap<DeviceId, Device>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    Wifi,
    Ethernet,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WifiCredentials {
    pub ssid: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthernetBlock {
    pub dhcp: bool,
    pub static_ip: Option<std::net::Ipv4Addr>,
    pub static_gateway: Option<std::net::Ipv4Addr>,
    pub static_netmask: Option<std::net::Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishProtocol {
    Mqtt,
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishMode {
    Default,
    Customize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTopicEntry {
    pub topic: String,
    pub register_ids: Vec<RegisterId>,
    pub interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultModeBlock {
    pub topic_publish: String,
    pub interval: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomizeModeBlock {
    pub topics: Vec<CustomTopicEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBlock {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub tls: bool,
    pub publish_mode: PublishMode,
    pub default_mode: DefaultModeBlock,
    pub customize_mode: CustomizeModeBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpBlock {
    pub endpoint: String,
    pub method: String,
    pub body_format: String,
    pub timeout_ms: u64,
    pub retry: u8,
    pub interval: String,
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub network_mode: NetworkMode,
    pub wifi: Option<WifiCredentials>,
    pub ethernet: EthernetBlock,
    pub protocol: PublishProtocol,
    pub mqtt: MqttBlock,
    pub http: Option<HttpBlock>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network_mode: NetworkMode::Ethernet,
            wifi: None,
            ethernet: EthernetBlock { dhcp: true, static_ip: None, static_gateway: None, static_netmask: None },
            protocol: PublishProtocol::Mqtt,
            mqtt: MqttBlock {
                broker_host: "localhost".to_string(),
                broker_port: 1883,
                client_id: None,
                username: None,
                password: None,
                keep_alive_secs: 120,
                clean_session: true,
                tls: false,
                publish_mode: PublishMode::Default,
                default_mode: DefaultModeBlock {
                    topic_publish: "fieldbridge/data".to_string(),
                    interval: "5s".to_string(),
                },
                customize_mode: CustomizeModeBlock { topics: vec![] },
            },
            http: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub retention_days: u32,
    pub reporting_interval_secs: u32,
    pub production_mode: u8,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { retention_days: 7, reporting_interval_secs: 60, production_mode: 0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimals_clamp_to_documented_range() {
        assert_eq!(clamp_decimals(-5), -1);
        assert_eq!(clamp_decimals(9), 6);
        assert_eq!(clamp_decimals(3), 3);
    }

    #[test]
    fn qos_clamps_to_0_2() {
        assert_eq!(clamp_qos(-1), 0);
        assert_eq!(clamp_qos(7), 2);
        assert_eq!(clamp_qos(1), 1);
    }

    #[test]
    fn device_ids_are_distinct_across_calls() {
        let a = generate_device_id();
        let b = generate_device_id();
        assert_ne!(a, b);
    }

    #[test]
    fn renumber_registers_is_1_based_and_contiguous() {
        let mut device = sample_device();
        device.registers.push(sample_register(10, 1));
        device.registers.push(sample_register(20, 2));
        device.registers.remove(0);
        device.renumber_registers();
        assert_eq!(device.registers[0].register_index, 1);
    }

    fn sample_register(address: u16, index: u32) -> Register {
        Register {
            register_id: generate_register_id(),
            register_index: index,
            name: "r".to_string(),
            address,
            function_code: FunctionCode::ReadHoldingRegisters,
            data_type: DataType::U16,
            scale: 1.0,
            offset: 0.0,
            decimals: -1,
            unit: String::new(),
            write_policy: None,
            mqtt_override: None,
        }
    }

    fn sample_device() -> Device {
        Device {
            device_id: generate_device_id(),
            name: "d".to_string(),
            protocol: ProtocolKind::Tcp,
            transport: TransportParams::Tcp { address: "127.0.0.1".parse().unwrap(), port: 502 },
            unit_id: 1,
            refresh_period_ms: 1000,
            timeout_ms: 500,
            retry_count: 1,
            enabled: true,
            registers: vec![],
        }
    }
}
