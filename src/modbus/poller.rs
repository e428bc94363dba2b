//! C6 — Modbus Poller: per-device scheduling for the RTU and TCP sibling
//! tasks named in spec section 4.6, reading C1's shadow copy each cycle
//! and feeding C2.

use super::codec::{apply_calibration, decode_raw, encode_write};
use super::transport::{ModbusError, ModbusTransport, TransportFactory};
use crate::clock::Clock;
use crate::config::{ConfigStore, Device, DeviceId, FunctionCode, ProtocolKind, Register, RegisterId};
use crate::queue::{Observation, ObservationQueue};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const SCHEDULE_TICK: Duration = Duration::from_millis(100);
const TCP_MAX_CONCURRENCY: usize = 8;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DeviceHealth {
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_success_ms: Option<i64>,
}

pub type HealthMap = Arc<Mutex<HashMap<DeviceId, DeviceHealth>>>;

pub struct PollerContext {
    pub config: Arc<ConfigStore>,
    pub observation_queue: Arc<ObservationQueue>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub clock: Arc<dyn Clock>,
    pub cancel: CancellationToken,
    pub health: HealthMap,
}

/// Read one register, retrying up to `device.retry_count` times within
/// `device.timeout_ms` per attempt (spec section 4.6 "timeout and retry").
async fn read_register_with_retry(
    transport: &mut dyn ModbusTransport,
    device: &Device,
    register: &Register,
) -> Result<Vec<u16>, ModbusError> {
    let deadline = Duration::from_millis(device.timeout_ms);
    let mut last_err = ModbusError::Timeout;
    for _ in 0..=device.retry_count {
        match transport.read(device.unit_id, register.function_code, register.address, register.data_type.register_span(), deadline).await {
            Ok(words) => return Ok(words),
            Err(e) => last_err = e,
        }
    }
    Err(last_err)
}

/// Poll every register of one device, enqueueing an Observation per
/// successful read. On exhausted retries, emits an ERROR marker (not
/// queued for publish) and updates the device's health counters (spec
/// section 4.6).
pub async fn poll_device(ctx: &PollerContext, transport: &mut dyn ModbusTransport, device: &Device) {
    let mut any_failure = false;

    for register in &device.registers {
        match read_register_with_retry(transport, device, register).await {
            Ok(raw) => {
                let raw_value = decode_raw(&raw, &register.data_type);
                let value = apply_calibration(raw_value, register.scale, register.offset, register.decimals);
                let obs = Observation {
                    device_id: device.device_id.clone(),
                    register_id: register.register_id.clone(),
                    register_name: register.name.clone(),
                    timestamp: ctx.clock.timestamp().into(),
                    raw,
                    value,
                    unit: register.unit.clone(),
                };
                if !ctx.observation_queue.enqueue(&obs).await {
                    metrics::counter!("fieldbridge_c6_enqueue_dropped").increment(1);
                    tracing::warn!(target: "modbus::poller", "C2 full, dropped observation for {}/{}", device.device_id, register.name);
                }
            }
            Err(e) => {
                any_failure = true;
                tracing::warn!(target: "modbus::poller", "device {} register {} read failed after retries: {e}", device.device_id, register.name);
            }
        }
    }

    let mut health = ctx.health.lock().await;
    let entry = health.entry(device.device_id.clone()).or_default();
    if any_failure {
        entry.consecutive_failures += 1;
        entry.last_error = Some("read failed after exhausting retries".to_string());
    } else {
        entry.consecutive_failures = 0;
        entry.last_error = None;
        entry.last_success_ms = Some(ctx.clock.monotonic_millis() as i64);
    }
}

fn is_due(now_ms: i64, last_poll: Option<i64>, refresh_period_ms: u64) -> bool {
    match last_poll {
        None => true,
        Some(last) => now_ms - last >= refresh_period_ms as i64,
    }
}

/// One physical RTU bus: devices sharing `serial_port_index` are polled
/// strictly in sequence (spec section 4.6 "between devices on the same
/// RTU bus, serialize").
pub async fn run_rtu_bus(ctx: Arc<PollerContext>, serial_port_index: u8) {
    let mut transport: Option<Box<dyn ModbusTransport>> = None;
    let mut last_poll: HashMap<DeviceId, i64> = HashMap::new();

    while !ctx.cancel.is_cancelled() {
        let devices = ctx.config.get_all_devices_with_registers(false).await.unwrap_or_default();
        let mine: Vec<Device> = devices
            .into_iter()
            .filter(|d| d.enabled && d.protocol == ProtocolKind::Rtu)
            .filter(|d| matches!(&d.transport, crate::config::TransportParams::Rtu { serial_port_index: p, .. } if *p == serial_port_index))
            .filter_map(device_view_to_device)
            .collect();

        let now = ctx.clock.monotonic_millis() as i64;
        for device in &mine {
            if !is_due(now, last_poll.get(&device.device_id).copied(), device.refresh_period_ms) {
                continue;
            }

            if transport.is_none() {
                transport = ctx.transport_factory.open(device).await.ok();
            }
            if let Some(t) = transport.as_deref_mut() {
                poll_device(&ctx, t, device).await;
            } else {
                tracing::warn!(target: "modbus::poller", "no RTU transport available for port {serial_port_index}");
            }
            last_poll.insert(device.device_id.clone(), now);
        }

        tokio::time::sleep(SCHEDULE_TICK).await;
    }
}

/// TCP devices poll in parallel, bounded by a semaphore (spec section
/// 4.6 "TCP parallel per-endpoint permitted but bounded").
pub async fn run_tcp_poller(ctx: Arc<PollerContext>) {
    let semaphore = Arc::new(tokio::sync::Semaphore::new(TCP_MAX_CONCURRENCY));
    let mut last_poll: HashMap<DeviceId, i64> = HashMap::new();

    while !ctx.cancel.is_cancelled() {
        let devices = ctx.config.get_all_devices_with_registers(false).await.unwrap_or_default();
        let mine: Vec<Device> = devices.into_iter().filter(|d| d.enabled && d.protocol == ProtocolKind::Tcp).filter_map(device_view_to_device).collect();

        let now = ctx.clock.monotonic_millis() as i64;
        let mut handles = Vec::new();
        for device in mine {
            if !is_due(now, last_poll.get(&device.device_id).copied(), device.refresh_period_ms) {
                continue;
            }
            last_poll.insert(device.device_id.clone(), now);

            let ctx = ctx.clone();
            let permit = semaphore.clone().acquire_owned().await.expect("semaphore not closed");
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                match ctx.transport_factory.open(&device).await {
                    Ok(mut transport) => poll_device(&ctx, transport.as_mut(), &device).await,
                    Err(e) => tracing::warn!(target: "modbus::poller", "failed to open TCP transport for {}: {e}", device.device_id),
                }
            }));
        }
        for h in handles {
            let _ = h.await;
        }

        tokio::time::sleep(SCHEDULE_TICK).await;
    }
}

/// Discovers the distinct RTU serial ports currently configured and
/// spawns/maintains one `run_rtu_bus` task per port.
pub async fn run_rtu_poller(ctx: Arc<PollerContext>) {
    let mut ports: HashMap<u8, tokio::task::JoinHandle<()>> = HashMap::new();

    while !ctx.cancel.is_cancelled() {
        let devices = ctx.config.get_all_devices_with_registers(true).await.unwrap_or_default();
        for device in &devices {
            if let crate::config::TransportParams::Rtu { serial_port_index, .. } = &device.transport {
                ports.entry(*serial_port_index).or_insert_with(|| tokio::spawn(run_rtu_bus(ctx.clone(), *serial_port_index)));
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    for (_, handle) in ports {
        handle.abort();
    }
}

fn device_view_to_device(view: crate::config::DeviceView) -> Option<Device> {
    Some(Device {
        device_id: view.device_id,
        name: view.name,
        protocol: view.protocol,
        transport: view.transport,
        unit_id: view.unit_id,
        refresh_period_ms: view.refresh_period_ms,
        timeout_ms: view.timeout_ms,
        retry_count: view.retry_count,
        enabled: view.enabled,
        registers: view.registers.unwrap_or_default(),
    })
}

enum WriteKind {
    SingleRegister,
    MultiRegister,
    SingleCoil,
    MultiCoil,
}

fn select_write_kind(register: &Register) -> Result<WriteKind, ModbusError> {
    let span = register.data_type.register_span();
    match register.function_code {
        FunctionCode::ReadHoldingRegisters if span == 1 => Ok(WriteKind::SingleRegister),
        FunctionCode::ReadHoldingRegisters => Ok(WriteKind::MultiRegister),
        FunctionCode::ReadCoils if span == 1 => Ok(WriteKind::SingleCoil),
        FunctionCode::ReadCoils => Ok(WriteKind::MultiCoil),
        _ => Err(ModbusError::Protocol("register is not writable (not a holding register or coil)".to_string())),
    }
}

/// BLE `write_register` command handler (spec section 4.6 "write
/// support"): computes the raw value, encodes it, picks the write
/// function code, and issues the write synchronously.
pub async fn write_register(
    transport_factory: &dyn TransportFactory,
    device: &Device,
    register: &Register,
    value: f64,
) -> Result<(), ModbusError> {
    let words = encode_write(value, register.scale, register.offset, &register.data_type);
    let deadline = Duration::from_millis(device.timeout_ms);
    let mut transport = transport_factory.open(device).await?;

    match select_write_kind(register)? {
        WriteKind::SingleRegister => transport.write_single_register(device.unit_id, register.address, words[0], deadline).await,
        WriteKind::MultiRegister => transport.write_multiple_registers(device.unit_id, register.address, &words, deadline).await,
        WriteKind::SingleCoil => transport.write_single_coil(device.unit_id, register.address, words[0] != 0, deadline).await,
        WriteKind::MultiCoil => {
            let bits: Vec<bool> = words.iter().map(|&w| w != 0).collect();
            transport.write_multiple_coils(device.unit_id, register.address, &bits, deadline).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{DataType, RegisterId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FlakyTransport {
        failures_remaining: AtomicUsize,
    }

    #[async_trait]
    impl ModbusTransport for FlakyTransport {
        async fn read(&mut self, _unit_id: u8, _fc: FunctionCode, _address: u16, _count: u16, _deadline: Duration) -> Result<Vec<u16>, ModbusError> {
            if self.failures_remaining.load(Ordering::SeqCst) > 0 {
                self.failures_remaining.fetch_sub(1, Ordering::SeqCst);
                return Err(ModbusError::Timeout);
            }
            Ok(vec![275])
        }
        async fn write_single_register(&mut self, _u: u8, _a: u16, _v: u16, _d: Duration) -> Result<(), ModbusError> {
            Ok(())
        }
        async fn write_multiple_registers(&mut self, _u: u8, _a: u16, _v: &[u16], _d: Duration) -> Result<(), ModbusError> {
            Ok(())
        }
        async fn write_single_coil(&mut self, _u: u8, _a: u16, _v: bool, _d: Duration) -> Result<(), ModbusError> {
            Ok(())
        }
        async fn write_multiple_coils(&mut self, _u: u8, _a: u16, _v: &[bool], _d: Duration) -> Result<(), ModbusError> {
            Ok(())
        }
    }

    fn sample_device() -> Device {
        Device {
            device_id: DeviceId("d1".into()),
            name: "PLC".into(),
            protocol: ProtocolKind::Tcp,
            transport: crate::config::TransportParams::Tcp { address: "127.0.0.1".parse().unwrap(), port: 502 },
            unit_id: 1,
            refresh_period_ms: 1000,
            timeout_ms: 100,
            retry_count: 2,
            enabled: true,
            registers: vec![Register {
                register_id: RegisterId("r1".into()),
                register_index: 1,
                name: "temp".into(),
                address: 0,
                function_code: FunctionCode::ReadHoldingRegisters,
                data_type: DataType::U16,
                scale: 0.1,
                offset: 0.0,
                decimals: -1,
                unit: "°C".into(),
                write_policy: None,
                mqtt_override: None,
            }],
        }
    }

    async fn context() -> PollerContext {
        PollerContext {
            config: Arc::new(
                ConfigStore::mount(
                    &crate::settings::GatewaySettings { fs_root: tempfile::tempdir().unwrap().into_path(), ..Default::default() },
                    Arc::new(FixedClock::rtc_invalid()),
                )
                .await
                .unwrap(),
            ),
            observation_queue: Arc::new(ObservationQueue::new(10)),
            transport_factory: Arc::new(crate::modbus::transport::DefaultTransportFactory),
            clock: Arc::new(FixedClock::rtc_invalid()),
            cancel: CancellationToken::new(),
            health: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    #[tokio::test]
    async fn retries_succeed_within_retry_count_and_enqueue_observation() {
        let ctx = context().await;
        let device = sample_device();
        let mut transport = FlakyTransport { failures_remaining: AtomicUsize::new(2) };

        poll_device(&ctx, &mut transport, &device).await;

        assert_eq!(ctx.observation_queue.size().await, 1);
        let obs = ctx.observation_queue.dequeue_nonblocking().await.unwrap();
        assert_eq!(obs.value, 27.5);

        let health = ctx.health.lock().await;
        assert_eq!(health.get(&device.device_id).unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn exhausted_retries_mark_health_failure_without_enqueueing() {
        let ctx = context().await;
        let device = sample_device();
        let mut transport = FlakyTransport { failures_remaining: AtomicUsize::new(10) };

        poll_device(&ctx, &mut transport, &device).await;

        assert_eq!(ctx.observation_queue.size().await, 0);
        let health = ctx.health.lock().await;
        assert_eq!(health.get(&device.device_id).unwrap().consecutive_failures, 1);
    }

    #[test]
    fn write_kind_selection_matches_spec_function_codes() {
        let mut reg = sample_device().registers.remove(0);
        assert!(matches!(select_write_kind(&reg).unwrap(), WriteKind::SingleRegister));

        reg.data_type = DataType::U32 { endian: crate::config::Endianness::Be };
        assert!(matches!(select_write_kind(&reg).unwrap(), WriteKind::MultiRegister));

        reg.function_code = FunctionCode::ReadCoils;
        reg.data_type = DataType::Bool;
        assert!(matches!(select_write_kind(&reg).unwrap(), WriteKind::SingleCoil));
    }
}
