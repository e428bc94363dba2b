//! Per-device Modbus transport: opens a TCP or RTU connection and issues
//! reads/writes with a deadline (spec section 4.6, section 5 "the codec
//! is given a deadline and reports timeout distinctly from protocol
//! errors").

use crate::config::{Device, FunctionCode, Parity, TransportParams};
use async_trait::async_trait;
use std::time::Duration;
use tokio_modbus::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum ModbusError {
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// A live connection to one device. Implementations wrap `tokio-modbus`
/// (TCP) or `tokio-serial` + `tokio-modbus` RTU framing.
#[async_trait]
pub trait ModbusTransport: Send {
    async fn read(&mut self, unit_id: u8, fc: FunctionCode, address: u16, count: u16, deadline: Duration) -> Result<Vec<u16>, ModbusError>;
    async fn write_single_register(&mut self, unit_id: u8, address: u16, value: u16, deadline: Duration) -> Result<(), ModbusError>;
    async fn write_multiple_registers(&mut self, unit_id: u8, address: u16, values: &[u16], deadline: Duration) -> Result<(), ModbusError>;
    async fn write_single_coil(&mut self, unit_id: u8, address: u16, value: bool, deadline: Duration) -> Result<(), ModbusError>;
    async fn write_multiple_coils(&mut self, unit_id: u8, address: u16, values: &[bool], deadline: Duration) -> Result<(), ModbusError>;
}

async fn with_deadline<T>(deadline: Duration, fut: impl std::future::Future<Output = Result<T, std::io::Error>>) -> Result<T, ModbusError> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(ModbusError::Protocol(e.to_string())),
        Err(_) => Err(ModbusError::Timeout),
    }
}

pub struct TcpTransport {
    ctx: tokio_modbus::client::Context,
}

impl TcpTransport {
    pub async fn connect(address: std::net::Ipv4Addr, port: u16, unit_id: u8) -> Result<Self, ModbusError> {
        let socket = std::net::SocketAddr::new(address.into(), port);
        let ctx = tcp::connect_slave(socket, Slave(unit_id)).await.map_err(|e| ModbusError::Unavailable(e.to_string()))?;
        Ok(Self { ctx })
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
    async fn read(&mut self, _unit_id: u8, fc: FunctionCode, address: u16, count: u16, deadline: Duration) -> Result<Vec<u16>, ModbusError> {
        match fc {
            FunctionCode::ReadHoldingRegisters => with_deadline(deadline, self.ctx.read_holding_registers(address, count)).await,
            FunctionCode::ReadInputRegisters => with_deadline(deadline, self.ctx.read_input_registers(address, count)).await,
            FunctionCode::ReadCoils => {
                let bits = with_deadline(deadline, self.ctx.read_coils(address, count)).await?;
                Ok(bits.into_iter().map(|b| b as u16).collect())
            }
            FunctionCode::ReadDiscreteInputs => {
                let bits = with_deadline(deadline, self.ctx.read_discrete_inputs(address, count)).await?;
                Ok(bits.into_iter().map(|b| b as u16).collect())
            }
        }
    }

    async fn write_single_register(&mut self, _unit_id: u8, address: u16, value: u16, deadline: Duration) -> Result<(), ModbusError> {
        with_deadline(deadline, self.ctx.write_single_register(address, value)).await
    }

    async fn write_multiple_registers(&mut self, _unit_id: u8, address: u16, values: &[u16], deadline: Duration) -> Result<(), ModbusError> {
        with_deadline(deadline, self.ctx.write_multiple_registers(address, values)).await
    }

    async fn write_single_coil(&mut self, _unit_id: u8, address: u16, value: bool, deadline: Duration) -> Result<(), ModbusError> {
        with_deadline(deadline, self.ctx.write_single_coil(address, value)).await
    }

    async fn write_multiple_coils(&mut self, _unit_id: u8, address: u16, values: &[bool], deadline: Duration) -> Result<(), ModbusError> {
        with_deadline(deadline, self.ctx.write_multiple_coils(address, values)).await
    }
}

pub struct RtuTransport {
    ctx: tokio_modbus::client::Context,
}

impl RtuTransport {
    /// Completes the RTU variant the teacher's `client::Context` left as
    /// a `// Rtu will be added in Week 2` stub (spec section 4.6).
    pub async fn open(serial_port_index: u8, baud: u32, parity: Parity, stop_bits: u8, unit_id: u8) -> Result<Self, ModbusError> {
        let path = format!("/dev/ttyUSB{serial_port_index}");
        let serial_parity = match parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        };
        let serial_stop_bits = match stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        let port = tokio_serial::new(&path, baud)
            .parity(serial_parity)
            .stop_bits(serial_stop_bits)
            .data_bits(tokio_serial::DataBits::Eight)
            .open_native_async()
            .map_err(|e| ModbusError::Unavailable(format!("failed to open {path}: {e}")))?;

        let ctx = rtu::attach_slave(port, Slave(unit_id));
        Ok(Self { ctx })
    }
}

#[async_trait]
impl ModbusTransport for RtuTransport {
    async fn read(&mut self, _unit_id: u8, fc: FunctionCode, address: u16, count: u16, deadline: Duration) -> Result<Vec<u16>, ModbusError> {
        match fc {
            FunctionCode::ReadHoldingRegisters => with_deadline(deadline, self.ctx.read_holding_registers(address, count)).await,
            FunctionCode::ReadInputRegisters => with_deadline(deadline, self.ctx.read_input_registers(address, count)).await,
            FunctionCode::ReadCoils => {
                let bits = with_deadline(deadline, self.ctx.read_coils(address, count)).await?;
                Ok(bits.into_iter().map(|b| b as u16).collect())
            }
            FunctionCode::ReadDiscreteInputs => {
                let bits = with_deadline(deadline, self.ctx.read_discrete_inputs(address, count)).await?;
                Ok(bits.into_iter().map(|b| b as u16).collect())
            }
        }
    }

    async fn write_single_register(&mut self, _unit_id: u8, address: u16, value: u16, deadline: Duration) -> Result<(), ModbusError> {
        with_deadline(deadline, self.ctx.write_single_register(address, value)).await
    }

    async fn write_multiple_registers(&mut self, _unit_id: u8, address: u16, values: &[u16], deadline: Duration) -> Result<(), ModbusError> {
        with_deadline(deadline, self.ctx.write_multiple_registers(address, values)).await
    }

    async fn write_single_coil(&mut self, _unit_id: u8, address: u16, value: bool, deadline: Duration) -> Result<(), ModbusError> {
        with_deadline(deadline, self.ctx.write_single_coil(address, value)).await
    }

    async fn write_multiple_coils(&mut self, _unit_id: u8, address: u16, values: &[bool], deadline: Duration) -> Result<(), ModbusError> {
        with_deadline(deadline, self.ctx.write_multiple_coils(address, values)).await
    }
}

/// Opens the right transport for a device. A seam so tests can supply a
/// mock transport instead of real I/O (spec section 8 end-to-end tests).
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn open(&self, device: &Device) -> Result<Box<dyn ModbusTransport>, ModbusError>;
}

pub struct DefaultTransportFactory;

#[async_trait]
impl TransportFactory for DefaultTransportFactory {
    async fn open(&self, device: &Device) -> Result<Box<dyn ModbusTransport>, ModbusError> {
        match &device.transport {
            TransportParams::Tcp { address, port } => Ok(Box::new(TcpTransport::connect(*address, *port, device.unit_id).await?)),
            TransportParams::Rtu { serial_port_index, baud, parity, stop_bits } => {
                Ok(Box::new(RtuTransport::open(*serial_port_index, *baud, *parity, *stop_bits, device.unit_id).await?))
            }
        }
    }
}
