//! C9 — Coordinator: startup/shutdown ordering and cross-component
//! wiring (spec section 4.9). Every other module is independently
//! testable; this is the only place they are all assembled.

use crate::ble::{BleProcessor, BleTransport, OtaManager};
use crate::clock::Clock;
use crate::config::{ConfigEvent, ConfigStore};
use crate::memory::{LargeMemoryAllocator, MemorySource, MemorySupervisor};
use crate::modbus::{run_rtu_poller, run_tcp_poller, DeviceHealth, HealthMap, PollerContext, TransportFactory};
use crate::mqtt::{LedIndicator, MqttContext, MqttSink};
use crate::network::{InterfaceKind, LinkStateSource, NetworkSupervisor};
use crate::queue::{ObservationQueue, RetryQueue};
use crate::settings::GatewaySettings;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

/// Every external collaborator the coordinator wires in, gathered so
/// `Coordinator::start` takes one argument instead of a dozen (spec
/// section 1 names each of these as outside this core's scope).
pub struct Collaborators {
    pub transport_factory: Arc<dyn TransportFactory>,
    pub link_source: Arc<dyn LinkStateSource>,
    pub mqtt_sink: Arc<dyn MqttSink>,
    pub led: Arc<dyn LedIndicator>,
    pub memory_source: Arc<dyn MemorySource>,
    pub allocator: Arc<dyn LargeMemoryAllocator>,
    pub ble_transport: Arc<dyn BleTransport>,
    pub ota: Arc<dyn OtaManager>,
    pub clock: Arc<dyn Clock>,
}

/// Join handles for every long-running task, kept so shutdown can wait
/// on them with a bounded grace period (spec section 4.9 "2s join
/// window per component").
struct Handles {
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// The fully assembled gateway: every component's `Arc` handle plus the
/// cancellation token shutdown propagates through.
pub struct Coordinator {
    pub config: Arc<ConfigStore>,
    pub observation_queue: Arc<ObservationQueue>,
    pub retry_queue: Arc<RetryQueue>,
    pub network: Arc<NetworkSupervisor>,
    pub memory: Arc<MemorySupervisor>,
    pub health: HealthMap,
    pub ble: Arc<BleProcessor>,
    cancel: CancellationToken,
    handles: Mutex<Handles>,
}

const JOIN_GRACE_PERIOD: Duration = Duration::from_secs(2);

impl Coordinator {
    /// Startup ordering (spec section 4.9): filesystem mount -> C1 (WAL
    /// recovery happens inside `ConfigStore::mount`) -> C4 -> C5 -> C2 ->
    /// C3 -> C6 -> C7 -> C8. Each later component only ever reads
    /// already-mounted earlier ones, so this order is also the only one
    /// that avoids a temporary "config not ready yet" state for readers.
    pub async fn start(settings: GatewaySettings, collaborators: Collaborators) -> anyhow::Result<Arc<Self>> {
        let cancel = CancellationToken::new();
        let clock = collaborators.clock.clone();

        let config = Arc::new(ConfigStore::mount(&settings, clock.clone()).await?);

        let network = Arc::new(NetworkSupervisor::new(
            InterfaceKind::Ethernet,
            &[InterfaceKind::Ethernet, InterfaceKind::Wifi],
            settings.hysteresis_ms,
            settings.failover_delay_ms,
            collaborators.link_source.clone(),
            clock.monotonic_millis() as i64,
        ));

        let observation_queue = Arc::new(ObservationQueue::new(settings.observation_queue_capacity));
        let retry_queue = Arc::new(
            RetryQueue::mount(settings.path_for("retry_queue.json"), settings.retry_queue_capacity, clock.clone()).await?,
        );

        let memory = Arc::new(MemorySupervisor::new(
            collaborators.memory_source.clone(),
            collaborators.allocator.clone(),
            observation_queue.clone(),
            retry_queue.clone(),
        ));

        let health: HealthMap = Arc::new(Mutex::new(HashMap::<crate::config::DeviceId, DeviceHealth>::new()));

        let ble = Arc::new(BleProcessor::new(
            config.clone(),
            collaborators.transport_factory.clone(),
            health.clone(),
            collaborators.ota.clone(),
            collaborators.ble_transport.clone(),
            clock.clone(),
            settings.fs_root.clone(),
            settings.ble_queue_depth,
            cancel.clone(),
        ));

        let this = Arc::new(Self {
            config: config.clone(),
            observation_queue: observation_queue.clone(),
            retry_queue: retry_queue.clone(),
            network: network.clone(),
            memory: memory.clone(),
            health: health.clone(),
            ble: ble.clone(),
            cancel: cancel.clone(),
            handles: Mutex::new(Handles { tasks: Vec::new() }),
        });

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(run_network_loop(network.clone(), settings.network_probe_secs, clock.clone(), cancel.clone())));
        tasks.push(tokio::spawn(run_memory_loop(memory.clone(), settings.memory_tick_secs, clock.clone(), cancel.clone())));

        let poller_ctx = Arc::new(PollerContext {
            config: config.clone(),
            observation_queue: observation_queue.clone(),
            transport_factory: collaborators.transport_factory.clone(),
            clock: clock.clone(),
            cancel: cancel.clone(),
            health: health.clone(),
        });
        tasks.push(tokio::spawn(run_tcp_poller(poller_ctx.clone())));
        tasks.push(tokio::spawn(run_rtu_poller(poller_ctx)));

        let mqtt_ctx = Arc::new(MqttContext::new(
            config.clone(),
            observation_queue.clone(),
            retry_queue.clone(),
            clock.clone(),
            collaborators.mqtt_sink.clone(),
            collaborators.led.clone(),
            cancel.clone(),
        ));
        tasks.push(tokio::spawn(crate::mqtt::run(mqtt_ctx)));

        tasks.push(tokio::spawn(ble.clone().run()));
        tasks.push(tokio::spawn(ble.clone().run_intake()));

        tasks.push(tokio::spawn(run_config_flush_loop(observation_queue.clone(), config.subscribe_events(), cancel.clone())));
        tasks.push(tokio::spawn(run_streaming_loop(ble.clone(), observation_queue.subscribe(), cancel.clone())));

        tasks.push(tokio::spawn(restart_watcher(memory.clone(), cancel.clone())));

        this.handles.lock().await.tasks = tasks;
        Ok(this)
    }

    /// Cooperative shutdown: cancel every task, then wait up to
    /// [`JOIN_GRACE_PERIOD`] total for them to finish (spec section 4.9).
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let mut handles = self.handles.lock().await;
        let tasks = std::mem::take(&mut handles.tasks);
        let join_all = futures_join_all(tasks);
        if tokio::time::timeout(JOIN_GRACE_PERIOD, join_all).await.is_err() {
            tracing::warn!(target: "coordinator", "shutdown grace period elapsed with tasks still running");
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

async fn futures_join_all(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}

async fn run_network_loop(network: Arc<NetworkSupervisor>, probe_secs: u64, clock: Arc<dyn Clock>, cancel: CancellationToken) {
    let interval = Duration::from_secs(probe_secs.max(1));
    while !cancel.is_cancelled() {
        let now = clock.monotonic_millis() as i64;
        network.probe_all(now).await;
        network.tick(now).await;
        tokio::time::sleep(interval).await;
    }
}

async fn run_memory_loop(memory: Arc<MemorySupervisor>, tick_secs: u64, clock: Arc<dyn Clock>, cancel: CancellationToken) {
    let interval = Duration::from_secs(tick_secs.max(1));
    while !cancel.is_cancelled() {
        memory.tick(clock.monotonic_millis() as i64).await;
        tokio::time::sleep(interval).await;
    }
}

/// Layer 1 of device-deletion cleanup (spec section 3, section 4.1
/// "on success triggers C2 flush-by-device", scenario section 8 #4):
/// holds the only handle this core keeps on both C1's event stream and
/// C2, since neither component depends on the other directly.
async fn run_config_flush_loop(observation_queue: Arc<ObservationQueue>, mut events: broadcast::Receiver<ConfigEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = events.recv() => match received {
                Ok(ConfigEvent::DeviceDeleted(id)) => {
                    let flushed = observation_queue.flush_device(&id).await;
                    if flushed > 0 {
                        tracing::info!(target: "coordinator", device_id = %id, flushed, "flushed queued observations for deleted device");
                    }
                }
                Ok(ConfigEvent::ConfigChanged) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "coordinator", skipped, "config event stream lagged, some device-deletion flushes may have been missed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Forwards live observations into active BLE `data` streaming sessions
/// (spec section 4.8, frame shape spec section 6
/// `{"status":"data","data":{...}}`). Reads from C2's tap channel rather
/// than draining the FIFO itself, so streaming never competes with C7
/// for the same entries.
async fn run_streaming_loop(ble: Arc<BleProcessor>, mut observations: broadcast::Receiver<crate::queue::Observation>, cancel: CancellationToken) {
    let core = ble.core();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = observations.recv() => match received {
                Ok(obs) => {
                    let is_streaming = core.streaming.lock().await.contains(&obs.device_id);
                    if is_streaming {
                        core.ble_transport.notify(serde_json::json!({
                            "status": "data",
                            "data": {
                                "device_id": obs.device_id,
                                "register_id": obs.register_id,
                                "register_name": obs.register_name,
                                "value": obs.value,
                                "unit": obs.unit,
                            },
                        })).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

/// Bridges C5's restart request into the process-wide cancellation
/// token: a fatal memory tier means every component should wind down
/// the same way a BLE `factory_reset` or operator-initiated stop would
/// (spec section 4.5 "requests a restart", section 4.9).
async fn restart_watcher(memory: Arc<MemorySupervisor>, cancel: CancellationToken) {
    memory.wait_for_restart_request().await;
    tracing::error!(target: "coordinator", "memory supervisor requested a restart, cancelling all components");
    cancel.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::NoopOta;
    use crate::clock::FixedClock;
    use crate::memory::{ExternalBackend, InternalBackend};
    use crate::modbus::DefaultTransportFactory;
    use crate::mqtt::NoopLed;
    use crate::network::InterfaceStatus;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubLinkSource;
    #[async_trait]
    impl LinkStateSource for StubLinkSource {
        async fn probe(&self, _interface: InterfaceKind) -> InterfaceStatus {
            InterfaceStatus::Down
        }
    }

    struct StubMqttSink;
    #[async_trait]
    impl MqttSink for StubMqttSink {
        async fn ensure_connected(&self) -> Result<(), crate::mqtt::MqttError> {
            Err(crate::mqtt::MqttError::NotConnected)
        }
        async fn publish(&self, _topic: &str, _payload: &[u8], _qos: u8, _retain: bool) -> Result<(), crate::mqtt::MqttError> {
            Err(crate::mqtt::MqttError::NotConnected)
        }
    }

    struct StubMemorySource {
        free: AtomicUsize,
    }
    impl MemorySource for StubMemorySource {
        fn free_internal_bytes(&self) -> usize {
            self.free.load(Ordering::SeqCst)
        }
        fn free_external_bytes(&self) -> usize {
            8_000_000
        }
    }

    struct NoopBleTransport;
    #[async_trait]
    impl BleTransport for NoopBleTransport {
        async fn recv(&self) -> Option<Value> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            None
        }
        async fn send(&self, _response: Value) {}
        async fn notify(&self, _event: Value) {}
    }

    #[tokio::test]
    async fn start_and_shutdown_completes_within_grace_period() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GatewaySettings { fs_root: dir.path().to_path_buf(), memory_tick_secs: 1, network_probe_secs: 1, ..Default::default() };
        let collaborators = Collaborators {
            transport_factory: Arc::new(DefaultTransportFactory),
            link_source: Arc::new(StubLinkSource),
            mqtt_sink: Arc::new(StubMqttSink),
            led: Arc::new(NoopLed),
            memory_source: Arc::new(StubMemorySource { free: AtomicUsize::new(60_000) }),
            allocator: Arc::new(ExternalBackend),
            ble_transport: Arc::new(NoopBleTransport),
            ota: Arc::new(NoopOta),
            clock: Arc::new(FixedClock::rtc_valid_at(2025, 1, 1)),
        };

        let coordinator = Coordinator::start(settings, collaborators).await.unwrap();
        assert!(coordinator.config.list_devices().await.unwrap().is_empty());

        let shutdown = tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown()).await;
        assert!(shutdown.is_ok(), "shutdown should finish within its own grace period plus slack");
    }

    #[tokio::test]
    async fn fatal_memory_tier_cancels_every_component() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GatewaySettings { fs_root: dir.path().to_path_buf(), memory_tick_secs: 1, network_probe_secs: 3600, ..Default::default() };
        let collaborators = Collaborators {
            transport_factory: Arc::new(DefaultTransportFactory),
            link_source: Arc::new(StubLinkSource),
            mqtt_sink: Arc::new(StubMqttSink),
            led: Arc::new(NoopLed),
            memory_source: Arc::new(StubMemorySource { free: AtomicUsize::new(1_000) }),
            allocator: Arc::new(InternalBackend { max_single_alloc: 64 }),
            ble_transport: Arc::new(NoopBleTransport),
            ota: Arc::new(NoopOta),
            clock: Arc::new(FixedClock::rtc_valid_at(2025, 1, 1)),
        };

        let coordinator = Coordinator::start(settings, collaborators).await.unwrap();
        let token = coordinator.cancellation_token();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled()).await.expect("restart watcher should cancel after fatal tier");
    }

    struct RecordingBleTransport {
        notifications: tokio::sync::mpsc::UnboundedSender<Value>,
    }

    #[async_trait]
    impl BleTransport for RecordingBleTransport {
        async fn recv(&self) -> Option<Value> {
            std::future::pending().await
        }
        async fn send(&self, _response: Value) {}
        async fn notify(&self, event: Value) {
            let _ = self.notifications.send(event);
        }
    }

    fn default_collaborators(ble_transport: Arc<dyn BleTransport>) -> Collaborators {
        Collaborators {
            transport_factory: Arc::new(DefaultTransportFactory),
            link_source: Arc::new(StubLinkSource),
            mqtt_sink: Arc::new(StubMqttSink),
            led: Arc::new(NoopLed),
            memory_source: Arc::new(StubMemorySource { free: AtomicUsize::new(60_000) }),
            allocator: Arc::new(ExternalBackend),
            ble_transport,
            ota: Arc::new(NoopOta),
            clock: Arc::new(FixedClock::rtc_valid_at(2025, 1, 1)),
        }
    }

    fn sample_device_input() -> crate::config::DeviceConfigInput {
        crate::config::DeviceConfigInput {
            name: "sensor".to_string(),
            protocol: crate::config::ProtocolKind::Tcp,
            transport: crate::config::TransportParams::Tcp { address: "127.0.0.1".parse().unwrap(), port: 502 },
            unit_id: 1,
            refresh_period_ms: 5000,
            timeout_ms: 1000,
            retry_count: 2,
            enabled: true,
        }
    }

    fn sample_observation(device_id: &crate::config::DeviceId) -> crate::queue::Observation {
        crate::queue::Observation {
            device_id: device_id.clone(),
            register_id: crate::config::RegisterId("r1".to_string()),
            register_name: "temp".to_string(),
            timestamp: crate::queue::ObservationTimestamp::Monotonic(0),
            raw: vec![275],
            value: 27.5,
            unit: "°C".to_string(),
        }
    }

    /// Spec section 3/4.1 invariant, scenario section 8 #4 (Layer 1):
    /// deleting a device must flush its queued observations out of C2,
    /// not merely out of C1's inventory.
    #[tokio::test]
    async fn deleting_a_device_flushes_its_queued_observations_from_c2() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GatewaySettings { fs_root: dir.path().to_path_buf(), memory_tick_secs: 3600, network_probe_secs: 3600, ..Default::default() };
        let coordinator = Coordinator::start(settings, default_collaborators(Arc::new(NoopBleTransport))).await.unwrap();

        let device_id = coordinator.config.create_device(sample_device_input()).await.unwrap();
        coordinator.observation_queue.enqueue(&sample_observation(&device_id)).await;
        assert_eq!(coordinator.observation_queue.size().await, 1);

        coordinator.config.delete_device(&device_id).await.unwrap();

        let flushed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if coordinator.observation_queue.is_empty().await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(flushed.is_ok(), "observation queue should be flushed shortly after device deletion");

        coordinator.shutdown().await;
    }

    /// Spec section 4.8 `data` streaming operation: observations for a
    /// device with an active streaming session must reach the BLE
    /// transport as `{"status":"data",...}` frames.
    #[tokio::test]
    async fn active_streaming_session_receives_data_frames_for_its_device() {
        let dir = tempfile::tempdir().unwrap();
        let settings = GatewaySettings { fs_root: dir.path().to_path_buf(), memory_tick_secs: 3600, network_probe_secs: 3600, ..Default::default() };
        let (notify_tx, mut notify_rx) = tokio::sync::mpsc::unbounded_channel();
        let coordinator = Coordinator::start(settings, default_collaborators(Arc::new(RecordingBleTransport { notifications: notify_tx }))).await.unwrap();

        let device_id = coordinator.config.create_device(sample_device_input()).await.unwrap();
        coordinator.ble.core().streaming.lock().await.insert(device_id.clone());

        coordinator.observation_queue.enqueue(&sample_observation(&device_id)).await;

        let frame = tokio::time::timeout(Duration::from_secs(2), notify_rx.recv()).await.unwrap().unwrap();
        assert_eq!(frame["status"], "data");
        assert_eq!(frame["data"]["device_id"], device_id.0);

        coordinator.shutdown().await;
    }
}
