//! C8 — BLE Command Processor: validates, queues and dispatches the CRUD
//! and system commands the BLE GATT transport decodes into whole JSON
//! objects (spec section 4.8). The transport itself — fragment
//! reassembly, MTU negotiation — is a named external collaborator (spec
//! section 1); this module only sees [`BleTransport::recv`] results.

mod handlers;

pub use handlers::OtaManager;

use crate::clock::Clock;
use crate::config::ConfigStore;
use crate::error::{Domain, GatewayError, Severity};
use crate::modbus::{HealthMap, TransportFactory};
use crate::queue::Priority;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const WORKER_TICK: Duration = Duration::from_millis(50);

/// One decoded BLE command, assigned a monotonically increasing id and
/// a priority bucket (spec section 3 "BLE Command", section 4.8).
#[derive(Debug, Clone)]
pub struct Command {
    pub id: u64,
    pub op: String,
    pub kind: String,
    pub priority: Priority,
    pub payload: Value,
    pub enqueued_at_ms: i64,
}

impl Command {
    fn field(&self, name: &str) -> Option<&Value> {
        self.payload.get(name)
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    pub fn u64_field(&self, name: &str) -> Option<u64> {
        self.field(name).and_then(Value::as_u64)
    }
}

/// The BLE GATT transport, a named external collaborator (spec section
/// 1). `recv` yields whole decoded command objects (fragment reassembly
/// already done); `send` carries one response; `notify` carries the
/// out-of-band progress/streaming frames spec section 6 documents
/// (`config_download_progress`, `ota_progress`, `{"status":"data",...}`, etc).
#[async_trait]
pub trait BleTransport: Send + Sync {
    async fn recv(&self) -> Option<Value>;
    async fn send(&self, response: Value);
    async fn notify(&self, event: Value);
}

#[derive(Default)]
struct Buckets {
    high: VecDeque<Command>,
    normal: VecDeque<Command>,
    low: VecDeque<Command>,
}

impl Buckets {
    fn total(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    fn push(&mut self, cmd: Command) {
        match cmd.priority {
            Priority::High => self.high.push_back(cmd),
            Priority::Normal => self.normal.push_back(cmd),
            Priority::Low => self.low.push_back(cmd),
        }
    }

    fn pop_next(&mut self) -> Option<Command> {
        self.high.pop_front().or_else(|| self.normal.pop_front()).or_else(|| self.low.pop_front())
    }
}

/// Shared context every handler needs; kept separate from
/// [`BleProcessor`] so handlers can be free functions taking `&BleCore`
/// rather than methods tangled up with the queue/worker machinery.
pub struct BleCore {
    pub config: Arc<ConfigStore>,
    pub transport_factory: Arc<dyn TransportFactory>,
    pub health: HealthMap,
    pub ota: Arc<dyn OtaManager>,
    pub ble_transport: Arc<dyn BleTransport>,
    pub clock: Arc<dyn Clock>,
    pub fs_root: std::path::PathBuf,
    pub streaming: Mutex<std::collections::HashSet<crate::config::DeviceId>>,
}

/// C8: a bounded priority queue plus a single-threaded worker that
/// drains it at 50ms granularity (spec section 4.8).
pub struct BleProcessor {
    core: Arc<BleCore>,
    buckets: Mutex<Buckets>,
    queue_depth: usize,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

impl BleProcessor {
    pub fn new(
        config: Arc<ConfigStore>,
        transport_factory: Arc<dyn TransportFactory>,
        health: HealthMap,
        ota: Arc<dyn OtaManager>,
        ble_transport: Arc<dyn BleTransport>,
        clock: Arc<dyn Clock>,
        fs_root: std::path::PathBuf,
        queue_depth: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            core: Arc::new(BleCore {
                config,
                transport_factory,
                health,
                ota,
                ble_transport,
                clock,
                fs_root,
                streaming: Mutex::new(std::collections::HashSet::new()),
            }),
            buckets: Mutex::new(Buckets::default()),
            queue_depth,
            next_id: AtomicU64::new(1),
            cancel,
        }
    }

    /// Validate, assign an id and enqueue a raw decoded envelope.
    /// Rejects with a busy error on overflow (spec section 4.8 "back
    /// pressure").
    pub async fn submit(&self, envelope: Value) -> Result<u64, GatewayError> {
        let op = envelope
            .get("op")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::invalid_config_domain(Domain::Ble, "command missing required 'op' field"))?
            .to_string();
        let kind = envelope
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::invalid_config_domain(Domain::Ble, "command missing required 'type' field"))?
            .to_string();
        let priority = match envelope.get("priority").and_then(Value::as_str) {
            Some("HIGH") | Some("high") => Priority::High,
            Some("LOW") | Some("low") => Priority::Low,
            _ => Priority::Normal,
        };

        let mut buckets = self.buckets.lock().await;
        if buckets.total() >= self.queue_depth {
            return Err(GatewayError::busy(Domain::Ble, "BLE command queue is full"));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let command = Command { id, op, kind, priority, payload: envelope, enqueued_at_ms: self.core.clock.monotonic_millis() as i64 };
        buckets.push(command);
        Ok(id)
    }

    /// Drains and executes commands until cancelled, sending each
    /// response through the BLE transport (spec section 4.8 "single-
    /// threaded worker drains the queue").
    pub async fn run(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            let next = self.buckets.lock().await.pop_next();
            if let Some(command) = next {
                let response = handlers::dispatch(self.core.clone(), &command).await;
                self.core.ble_transport.send(response).await;
            } else {
                tokio::time::sleep(WORKER_TICK).await;
            }
        }
    }

    /// Feeds [`BleTransport::recv`] into [`submit`], used by the
    /// coordinator to wire the transport's inbound stream into the queue.
    pub async fn run_intake(self: Arc<Self>) {
        while !self.cancel.is_cancelled() {
            match self.core.ble_transport.recv().await {
                Some(envelope) => {
                    if let Err(e) = self.submit(envelope).await {
                        self.core.ble_transport.send(e.to_response_value()).await;
                    }
                }
                None => tokio::time::sleep(WORKER_TICK).await,
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.buckets.lock().await.total()
    }

    /// Exposes the shared handler context so the coordinator can forward
    /// live observations into active `data` streaming sessions (spec
    /// section 4.8) without reaching into worker-internal state.
    pub fn core(&self) -> Arc<BleCore> {
        self.core.clone()
    }
}

impl GatewayError {
    /// CONFIG/BLE-domain "invalid request shape" error — used for
    /// envelope-level validation that happens before a command is even
    /// assigned an id (spec section 4.8).
    fn invalid_config_domain(domain: Domain, message: impl Into<String>) -> Self {
        Self::new(domain, Severity::Error, 1, message)
    }

    fn to_response_value(&self) -> Value {
        serde_json::to_value(self.to_response()).unwrap_or_else(|_| serde_json::json!({"status": "error"}))
    }
}

/// No-op OTA delegate: OTA download/verify/flash is a named external
/// collaborator out of scope for this core (spec section 1).
pub struct NoopOta;

#[async_trait]
impl OtaManager for NoopOta {
    async fn handle(&self, _command: &Command) -> Result<Value, GatewayError> {
        Err(GatewayError::new(Domain::System, Severity::Warn, 10, "OTA is handled by an external collaborator not wired into this core"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::modbus::DefaultTransportFactory;
    use crate::settings::GatewaySettings;
    use tokio::sync::mpsc;

    struct ChannelTransport {
        inbound: Mutex<mpsc::UnboundedReceiver<Value>>,
        outbound: mpsc::UnboundedSender<Value>,
    }

    #[async_trait]
    impl BleTransport for ChannelTransport {
        async fn recv(&self) -> Option<Value> {
            self.inbound.lock().await.recv().await
        }
        async fn send(&self, response: Value) {
            let _ = self.outbound.send(response);
        }
        async fn notify(&self, _event: Value) {}
    }

    async fn processor(dir: &std::path::Path, depth: usize) -> (Arc<BleProcessor>, mpsc::UnboundedReceiver<Value>) {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::rtc_valid_at(2025, 1, 1));
        let config = Arc::new(ConfigStore::mount(&GatewaySettings { fs_root: dir.to_path_buf(), ..Default::default() }, clock.clone()).await.unwrap());
        let (_in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ChannelTransport { inbound: Mutex::new(in_rx), outbound: out_tx });
        let processor = Arc::new(BleProcessor::new(
            config,
            Arc::new(DefaultTransportFactory),
            Arc::new(Mutex::new(std::collections::HashMap::new())),
            Arc::new(NoopOta),
            transport,
            clock,
            dir.to_path_buf(),
            depth,
            CancellationToken::new(),
        ));
        (processor, out_rx)
    }

    #[tokio::test]
    async fn overflow_is_rejected_with_busy_error() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _rx) = processor(dir.path(), 2).await;

        processor.submit(serde_json::json!({"op": "read", "type": "devices"})).await.unwrap();
        processor.submit(serde_json::json!({"op": "read", "type": "devices"})).await.unwrap();
        let err = processor.submit(serde_json::json!({"op": "read", "type": "devices"})).await.unwrap_err();
        assert_eq!(err.domain, Domain::Ble);
    }

    #[tokio::test]
    async fn missing_op_is_rejected_before_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, _rx) = processor(dir.path(), 8).await;
        let err = processor.submit(serde_json::json!({"type": "devices"})).await.unwrap_err();
        assert_eq!(err.domain, Domain::Ble);
    }

    #[tokio::test]
    async fn high_priority_drains_before_normal() {
        let dir = tempfile::tempdir().unwrap();
        let (processor, mut rx) = processor(dir.path(), 8).await;

        processor.submit(serde_json::json!({"op": "read", "type": "devices", "priority": "NORMAL"})).await.unwrap();
        processor.submit(serde_json::json!({"op": "read", "type": "server_config", "priority": "HIGH"})).await.unwrap();

        let worker = tokio::spawn(processor.clone().run());
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        worker.abort();

        // HIGH (server_config read) must be answered before NORMAL (devices read).
        assert!(first.get("status").is_some());
        assert_ne!(first, second);
    }
}
