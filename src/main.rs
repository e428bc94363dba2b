//! FieldBridge binary entry point: loads bootstrap settings, wires the
//! real collaborators (Modbus transports, rumqttc broker connection,
//! the platform link-state/BLE stacks), and runs until a shutdown
//! signal or a fatal memory tier asks the coordinator to stop.

use anyhow::{Context, Result};
use fieldbridge::ble::{BleTransport, NoopOta};
use fieldbridge::clock::SystemClock;
use fieldbridge::memory::{ExternalBackend, FallbackAllocator, InternalBackend, MemorySource};
use fieldbridge::modbus::DefaultTransportFactory;
use fieldbridge::mqtt::{deterministic_client_id, MqttSink, NoopLed, RumqttcSink};
use fieldbridge::network::{InterfaceKind, InterfaceStatus, LinkStateSource};
use fieldbridge::settings::load_settings;
use fieldbridge::{Collaborators, Coordinator};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// The on-device PSRAM/internal-RAM free-byte counters are a named
/// external collaborator (spec section 1, section 4.5) this hosted port
/// has no access to. Reports generous constants so the memory
/// supervisor stays Healthy under normal operation instead of reacting
/// to host machine memory pressure that has nothing to do with the
/// gateway's own budget.
struct HostMemorySource;

impl MemorySource for HostMemorySource {
    fn free_internal_bytes(&self) -> usize {
        200_000
    }
    fn free_external_bytes(&self) -> usize {
        8_000_000
    }
}

/// The platform's WiFi/Ethernet link-state API is a named external
/// collaborator (spec section 1) this hosted port has no access to.
/// Reports everything as down so the network supervisor stays on its
/// configured primary interface rather than failing over to nothing.
struct UnavailableLinkSource;

#[async_trait::async_trait]
impl LinkStateSource for UnavailableLinkSource {
    async fn probe(&self, _interface: InterfaceKind) -> InterfaceStatus {
        InterfaceStatus::Down
    }
}

/// The BLE GATT transport is a named external collaborator (spec
/// section 1): fragment reassembly and MTU negotiation happen on the
/// platform's BLE stack, which this hosted port has no access to.
struct UnavailableBleTransport;

#[async_trait::async_trait]
impl BleTransport for UnavailableBleTransport {
    async fn recv(&self) -> Option<serde_json::Value> {
        std::future::pending().await
    }
    async fn send(&self, _response: serde_json::Value) {}
    async fn notify(&self, _event: serde_json::Value) {}
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let settings = load_settings().context("failed to load gateway settings")?;
    std::fs::create_dir_all(&settings.fs_root).context("failed to create gateway filesystem root")?;

    let clock = Arc::new(SystemClock::new());

    // A bootstrap device-id-shaped seed; production wiring would read
    // the platform's MAC address instead.
    let client_id = deterministic_client_id("fieldbridge-gateway");
    let mqtt_sink: Arc<dyn MqttSink> = Arc::new(RumqttcSink::connect("localhost", 1883, &client_id, None, None, 120, true));

    let collaborators = Collaborators {
        transport_factory: Arc::new(DefaultTransportFactory),
        link_source: Arc::new(UnavailableLinkSource),
        mqtt_sink,
        led: Arc::new(NoopLed),
        memory_source: Arc::new(HostMemorySource),
        allocator: Arc::new(FallbackAllocator::new(Box::new(ExternalBackend), Box::new(InternalBackend { max_single_alloc: 4096 }))),
        ble_transport: Arc::new(UnavailableBleTransport),
        ota: Arc::new(NoopOta),
        clock: clock.clone(),
    };

    let coordinator = Coordinator::start(settings, collaborators).await.context("failed to start gateway")?;

    tracing::info!("fieldbridge gateway running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;

    tracing::info!("shutdown signal received, stopping gateway");
    coordinator.shutdown().await;
    Ok(())
}
