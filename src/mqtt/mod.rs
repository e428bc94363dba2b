//! C7 — MQTT Publisher: drains C2 (and services C3) on an interval
//! state machine, publishing default- or customize-mode payloads (spec
//! section 4.7).

use crate::clock::Clock;
use crate::config::wal::fnv1a_hash;
use crate::config::{ConfigStore, CustomTopicEntry, DeviceId, PublishMode, RegisterId};
use crate::error::GatewayError;
use crate::queue::{Observation, ObservationQueue, Priority, RetryQueue};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BUFFER_MIN: usize = 512;
const BUFFER_MAX: usize = 16_384;
const BUFFER_BYTES_PER_REGISTER: usize = 64;
const BUFFER_BASE_BYTES: usize = 300;
const MAX_REGISTERS_PER_PUBLISH: usize = 200;
const RETAIN_MAX_BYTES: usize = 16 * 1024;
const RETRY_TTL_MS: i64 = 24 * 60 * 60 * 1000;
/// Not named explicitly in spec section 4.7's MQTT block; a reasonable
/// default given the block carries no per-publish QoS field.
const PUBLISH_QOS: u8 = 1;
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("not connected to broker")]
    NotConnected,
    #[error("publish failed: {0}")]
    Send(String),
}

/// The physical MQTT transport, a named external collaborator (spec
/// section 1). `RumqttcSink` is the real implementation; tests supply a
/// recording double.
#[async_trait]
pub trait MqttSink: Send + Sync {
    async fn ensure_connected(&self) -> Result<(), MqttError>;
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<(), MqttError>;
}

/// Status-LED component, a named external collaborator (spec section
/// 4.7 step 6 "request an LED blink"). Mockable; production wiring would
/// drive a GPIO, which this hosted port has no access to.
pub trait LedIndicator: Send + Sync {
    fn blink(&self);
}

pub struct NoopLed;
impl LedIndicator for NoopLed {
    fn blink(&self) {}
}

pub struct RumqttcSink {
    client: rumqttc::AsyncClient,
    connected: Arc<AtomicBool>,
}

impl RumqttcSink {
    /// Connects and spawns the event-loop task. `poll()` erroring and
    /// being called again is rumqttc's own reconnect path — looping it
    /// with a sleep on error gives exactly the spec's "5s reconnect
    /// backoff" for free (spec section 4.7).
    pub fn connect(
        broker_host: &str,
        broker_port: u16,
        client_id: &str,
        username: Option<&str>,
        password: Option<&str>,
        keep_alive_secs: u16,
        clean_session: bool,
    ) -> Self {
        let mut options = rumqttc::MqttOptions::new(client_id, broker_host, broker_port);
        options.set_keep_alive(Duration::from_secs(keep_alive_secs as u64));
        options.set_clean_session(clean_session);
        options.set_connection_timeout(15);
        if let (Some(user), Some(pass)) = (username, password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = rumqttc::AsyncClient::new(options, 100);
        let connected = Arc::new(AtomicBool::new(false));
        let connected_task = connected.clone();
        let host = broker_host.to_string();

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(ack))) => {
                        if ack.code == rumqttc::ConnectReturnCode::Success {
                            connected_task.store(true, Ordering::SeqCst);
                            tracing::info!(target: "mqtt", "connected to broker at {host}");
                        } else {
                            tracing::error!(target: "mqtt", "broker rejected connection: {:?}", ack.code);
                        }
                    }
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::Disconnect)) => {
                        connected_task.store(false, Ordering::SeqCst);
                        tracing::warn!(target: "mqtt", "disconnected from broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected_task.store(false, Ordering::SeqCst);
                        tracing::error!(target: "mqtt", "mqtt event loop error: {e}");
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        });

        Self { client, connected }
    }
}

#[async_trait]
impl MqttSink for RumqttcSink {
    async fn ensure_connected(&self) -> Result<(), MqttError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MqttError::NotConnected)
        }
    }

    async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Result<(), MqttError> {
        let qos = match qos {
            0 => rumqttc::QoS::AtMostOnce,
            2 => rumqttc::QoS::ExactlyOnce,
            _ => rumqttc::QoS::AtLeastOnce,
        };
        self.client.publish(topic, qos, retain, payload.to_vec()).await.map_err(|e| MqttError::Send(e.to_string()))
    }
}

/// Derives a stable client id from whatever stands in for the device's
/// MAC address on this hosted target (spec section 4.7 "deterministic
/// id derived from the device MAC").
pub fn deterministic_client_id(seed: &str) -> String {
    format!("fieldbridge-{:016x}", fnv1a_hash(seed.as_bytes()))
}

fn parse_interval_ms(input: &str) -> Result<u64, GatewayError> {
    let trimmed = input.trim();
    let split_at = trimmed.find(|c: char| !c.is_ascii_digit()).unwrap_or(trimmed.len());
    let (num_part, unit_part) = trimmed.split_at(split_at);
    let num: u64 = num_part.parse().map_err(|_| GatewayError::invalid_config(format!("interval '{input}' has no numeric value")))?;

    let multiplier = match unit_part.trim() {
        "" | "ms" => 1,
        "s" | "sec" | "secs" | "second" | "seconds" => 1_000,
        "m" | "min" | "mins" | "minute" | "minutes" => 60_000,
        other => return Err(GatewayError::invalid_config(format!("unrecognized interval unit '{other}'"))),
    };
    Ok(num * multiplier)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    Disconnected,
    Connecting,
    Connected,
    Publishing,
}

pub struct MqttContext {
    config: Arc<ConfigStore>,
    observation_queue: Arc<ObservationQueue>,
    retry_queue: Arc<RetryQueue>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn MqttSink>,
    led: Arc<dyn LedIndicator>,
    cancel: CancellationToken,

    state: std::sync::Mutex<PublisherState>,
    buffer_bytes: AtomicUsize,
    buffer_dirty: AtomicBool,
    last_config_token: AtomicU64,
    last_publish_default_ms: AtomicI64,
    last_publish_custom_ms: tokio::sync::Mutex<HashMap<String, i64>>,
    target_locked: AtomicBool,
    skipped_deleted_device_samples: AtomicU64,
}

impl MqttContext {
    pub fn new(
        config: Arc<ConfigStore>,
        observation_queue: Arc<ObservationQueue>,
        retry_queue: Arc<RetryQueue>,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn MqttSink>,
        led: Arc<dyn LedIndicator>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            observation_queue,
            retry_queue,
            clock,
            sink,
            led,
            cancel,
            state: std::sync::Mutex::new(PublisherState::Disconnected),
            buffer_bytes: AtomicUsize::new(BUFFER_MIN),
            buffer_dirty: AtomicBool::new(true),
            last_config_token: AtomicU64::new(u64::MAX),
            last_publish_default_ms: AtomicI64::new(i64::MIN / 2),
            last_publish_custom_ms: tokio::sync::Mutex::new(HashMap::new()),
            target_locked: AtomicBool::new(false),
            skipped_deleted_device_samples: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> PublisherState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: PublisherState) {
        *self.state.lock().unwrap() = state;
    }

    fn buffer_size(&self) -> usize {
        self.buffer_bytes.load(Ordering::SeqCst)
    }
}

/// Recomputes the cached send-buffer size if dirty (spec section 4.7
/// "Buffer sizing").
async fn refresh_buffer_size(ctx: &MqttContext) {
    if !ctx.buffer_dirty.load(Ordering::SeqCst) {
        return;
    }
    let devices = ctx.config.get_all_devices_with_registers(true).await.unwrap_or_default();
    let total_registers: usize = devices.iter().map(|d| d.register_count.unwrap_or(0)).sum();
    let bytes = (total_registers * BUFFER_BYTES_PER_REGISTER + BUFFER_BASE_BYTES).clamp(BUFFER_MIN, BUFFER_MAX);
    ctx.buffer_bytes.store(bytes, Ordering::SeqCst);
    ctx.buffer_dirty.store(false, Ordering::SeqCst);
}

/// Publishes a single payload, handling the poison/retry/LED outcomes
/// shared by every mode (spec section 4.7 step 5/6).
async fn publish_payload(ctx: &MqttContext, topic: &str, payload: &[u8]) {
    if payload.is_empty() {
        tracing::warn!(target: "mqtt", "serialized payload for {topic} was empty, skipping");
        return;
    }

    let buffer = ctx.buffer_size();
    if payload.len() > buffer {
        let err = GatewayError::poison_payload(format!("payload for {topic} is {} bytes, exceeds cached buffer of {buffer} bytes", payload.len()));
        tracing::error!(target: "mqtt", code = err.code(), "{err}");
        return;
    }

    let retain = payload.len() <= RETAIN_MAX_BYTES;
    match ctx.sink.publish(topic, payload, PUBLISH_QOS, retain).await {
        Ok(()) => ctx.led.blink(),
        Err(e) => {
            tracing::warn!(target: "mqtt", "publish to {topic} failed: {e}, enqueueing to retry queue");
            if let Err(enqueue_err) = ctx.retry_queue.enqueue(topic.to_string(), payload.to_vec(), Priority::Normal, RETRY_TTL_MS, buffer).await {
                tracing::error!(target: "mqtt", "failed to enqueue retry payload: {enqueue_err}");
            }
        }
    }
}

fn dedup_key(obs: &Observation) -> String {
    format!("{}_{}", obs.device_id.0, obs.register_id.0)
}

fn build_devices_json(
    samples: &HashMap<String, Observation>,
    device_names: &HashMap<DeviceId, String>,
    register_filter: Option<&[RegisterId]>,
    skipped: &AtomicU64,
) -> serde_json::Map<String, serde_json::Value> {
    let mut devices: HashMap<DeviceId, serde_json::Map<String, serde_json::Value>> = HashMap::new();

    for obs in samples.values() {
        if let Some(filter) = register_filter {
            if !filter.contains(&obs.register_id) {
                continue;
            }
        }
        let Some(name) = device_names.get(&obs.device_id) else {
            skipped.fetch_add(1, Ordering::Relaxed);
            continue;
        };
        let entry = devices.entry(obs.device_id.clone()).or_insert_with(|| {
            let mut m = serde_json::Map::new();
            m.insert("device_name".to_string(), serde_json::Value::String(name.clone()));
            m
        });
        entry.insert(
            obs.register_name.clone(),
            serde_json::json!({ "value": obs.value, "unit": obs.unit }),
        );
    }

    devices.into_iter().map(|(id, v)| (id.0, serde_json::Value::Object(v))).collect()
}

fn build_payload(timestamp: &str, devices_json: serde_json::Map<String, serde_json::Value>) -> Vec<u8> {
    let payload = serde_json::json!({ "timestamp": timestamp, "devices": serde_json::Value::Object(devices_json) });
    serde_json::to_vec(&payload).unwrap_or_default()
}

/// One tick of the publish-interval state machine (spec section 4.7
/// steps 1-7).
pub async fn tick(ctx: &MqttContext) {
    let now_ms = ctx.clock.monotonic_millis() as i64;

    let token = ctx.config.change_token();
    if ctx.last_config_token.swap(token, Ordering::SeqCst) != token {
        ctx.buffer_dirty.store(true, Ordering::SeqCst);
    }
    refresh_buffer_size(ctx).await;

    if ctx.sink.ensure_connected().await.is_err() {
        ctx.set_state(PublisherState::Disconnected);
        return;
    }
    if ctx.state() == PublisherState::Disconnected {
        ctx.set_state(PublisherState::Connecting);
    }
    ctx.set_state(PublisherState::Connected);

    let server = match ctx.config.get_server_config().await {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(target: "mqtt", "failed to read server config: {e}");
            return;
        }
    };

    let sink_for_retry = ctx.sink.clone();
    ctx.retry_queue
        .drain_due(now_ms, move |topic, payload| {
            let sink = sink_for_retry.clone();
            async move { sink.publish(&topic, &payload, PUBLISH_QOS, false).await.is_ok() }
        })
        .await;

    // Step 1/2: which modes elapsed, latching last_publish immediately.
    let mut default_elapsed = false;
    let mut custom_elapsed: Vec<CustomTopicEntry> = Vec::new();

    match server.mqtt.publish_mode {
        PublishMode::Default => {
            let Ok(interval_ms) = parse_interval_ms(&server.mqtt.default_mode.interval) else {
                tracing::warn!(target: "mqtt", "unparseable default-mode interval '{}'", server.mqtt.default_mode.interval);
                return;
            };
            let last = ctx.last_publish_default_ms.load(Ordering::SeqCst);
            if now_ms - last >= interval_ms as i64 {
                default_elapsed = true;
            }
        }
        PublishMode::Customize => {
            let mut last_map = ctx.last_publish_custom_ms.lock().await;
            for topic in &server.mqtt.customize_mode.topics {
                let Ok(interval_ms) = parse_interval_ms(&topic.interval) else {
                    tracing::warn!(target: "mqtt", "unparseable customize-mode interval '{}' for topic {}", topic.interval, topic.topic);
                    continue;
                };
                let last = *last_map.get(&topic.topic).unwrap_or(&(i64::MIN / 2));
                if now_ms - last >= interval_ms as i64 {
                    custom_elapsed.push(topic.clone());
                }
            }
            drop(last_map);
        }
    }

    if !default_elapsed && custom_elapsed.is_empty() {
        return;
    }

    if ctx.target_locked.swap(true, Ordering::SeqCst) {
        return;
    }
    let _unlock = TargetLockGuard(&ctx.target_locked);

    let target_time = now_ms;
    if default_elapsed {
        ctx.last_publish_default_ms.store(target_time, Ordering::SeqCst);
    }
    if !custom_elapsed.is_empty() {
        let mut last_map = ctx.last_publish_custom_ms.lock().await;
        for topic in &custom_elapsed {
            last_map.insert(topic.topic.clone(), target_time);
        }
    }

    if ctx.observation_queue.is_empty().await {
        return;
    }

    ctx.set_state(PublisherState::Publishing);

    let drained = ctx.observation_queue.drain_up_to(MAX_REGISTERS_PER_PUBLISH).await;
    let mut samples: HashMap<String, Observation> = HashMap::new();
    for obs in drained {
        samples.insert(dedup_key(&obs), obs);
    }

    let devices = ctx.config.get_all_devices_with_registers(true).await.unwrap_or_default();
    let device_names: HashMap<DeviceId, String> = devices.into_iter().map(|d| (d.device_id, d.name)).collect();
    let timestamp = ctx.clock.timestamp().to_display_string();

    if default_elapsed {
        let devices_json = build_devices_json(&samples, &device_names, None, &ctx.skipped_deleted_device_samples);
        if !devices_json.is_empty() {
            let payload = build_payload(&timestamp, devices_json);
            publish_payload(ctx, &server.mqtt.default_mode.topic_publish, &payload).await;
        }
    }

    for topic in &custom_elapsed {
        let devices_json = build_devices_json(&samples, &device_names, Some(&topic.register_ids), &ctx.skipped_deleted_device_samples);
        if devices_json.is_empty() {
            continue;
        }
        let payload = build_payload(&timestamp, devices_json);
        publish_payload(ctx, &topic.topic, &payload).await;
    }

    let skipped = ctx.skipped_deleted_device_samples.swap(0, Ordering::Relaxed);
    if skipped > 0 {
        tracing::info!(target: "mqtt", "skipped {skipped} samples from since-deleted devices this cycle");
    }

    ctx.set_state(PublisherState::Connected);
}

struct TargetLockGuard<'a>(&'a AtomicBool);
impl Drop for TargetLockGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs the publisher's dedicated task until cancelled (spec section
/// 4.7 "runs a dedicated task").
pub async fn run(ctx: Arc<MqttContext>) {
    while !ctx.cancel.is_cancelled() {
        tick(&ctx).await;
        tokio::time::sleep(TICK_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::config::{DeviceConfigInput, ProtocolKind, TransportParams};

    struct RecordingSink {
        published: tokio::sync::Mutex<Vec<(String, Vec<u8>, bool)>>,
        fail_next: AtomicBool,
        connected: AtomicBool,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { published: tokio::sync::Mutex::new(Vec::new()), fail_next: AtomicBool::new(false), connected: AtomicBool::new(true) }
        }
    }

    #[async_trait]
    impl MqttSink for RecordingSink {
        async fn ensure_connected(&self) -> Result<(), MqttError> {
            if self.connected.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(MqttError::NotConnected)
            }
        }

        async fn publish(&self, topic: &str, payload: &[u8], _qos: u8, retain: bool) -> Result<(), MqttError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(MqttError::Send("simulated failure".to_string()));
            }
            self.published.lock().await.push((topic.to_string(), payload.to_vec(), retain));
            Ok(())
        }
    }

    async fn harness(dir: &std::path::Path) -> (Arc<MqttContext>, Arc<RecordingSink>, Arc<ConfigStore>) {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::rtc_invalid());
        let config = Arc::new(
            ConfigStore::mount(&crate::settings::GatewaySettings { fs_root: dir.to_path_buf(), ..Default::default() }, clock.clone())
                .await
                .unwrap(),
        );
        let observation_queue = Arc::new(ObservationQueue::new(100));
        let retry_queue = Arc::new(RetryQueue::mount(dir.join("mqtt_retry.json"), 100, clock.clone()).await.unwrap());
        let sink = Arc::new(RecordingSink::new());
        let ctx = Arc::new(MqttContext::new(
            config.clone(),
            observation_queue,
            retry_queue,
            clock,
            sink.clone(),
            Arc::new(NoopLed),
            CancellationToken::new(),
        ));
        (ctx, sink, config)
    }

    #[test]
    fn interval_parsing_matches_documented_units() {
        assert_eq!(parse_interval_ms("500").unwrap(), 500);
        assert_eq!(parse_interval_ms("500ms").unwrap(), 500);
        assert_eq!(parse_interval_ms("5s").unwrap(), 5_000);
        assert_eq!(parse_interval_ms("5secs").unwrap(), 5_000);
        assert_eq!(parse_interval_ms("2m").unwrap(), 120_000);
        assert_eq!(parse_interval_ms("2minutes").unwrap(), 120_000);
        assert!(parse_interval_ms("5fortnights").is_err());
    }

    #[tokio::test]
    async fn empty_queue_releases_lock_without_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, sink, _config) = harness(dir.path()).await;

        tick(&ctx).await;

        assert!(sink.published.lock().await.is_empty());
        assert!(!ctx.target_locked.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn default_mode_publishes_deduplicated_samples_and_skips_deleted_devices() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, sink, config) = harness(dir.path()).await;

        let device_id = config
            .create_device(DeviceConfigInput {
                name: "PLC-1".to_string(),
                protocol: ProtocolKind::Tcp,
                transport: TransportParams::Tcp { address: "10.0.0.5".parse().unwrap(), port: 502 },
                unit_id: 1,
                refresh_period_ms: 1000,
                timeout_ms: 300,
                retry_count: 1,
                enabled: true,
            })
            .await
            .unwrap();

        let sample = |value: f64| crate::queue::Observation {
            device_id: device_id.clone(),
            register_id: RegisterId("r1".to_string()),
            register_name: "temp".to_string(),
            timestamp: crate::queue::ObservationTimestamp::Monotonic(0),
            raw: vec![1],
            value,
            unit: "C".to_string(),
        };

        ctx.observation_queue.enqueue(&sample(10.0)).await;
        ctx.observation_queue.enqueue(&sample(20.0)).await; // newest wins

        ctx.observation_queue
            .enqueue(&crate::queue::Observation {
                device_id: DeviceId("ghost".to_string()),
                register_id: RegisterId("r2".to_string()),
                register_name: "pressure".to_string(),
                timestamp: crate::queue::ObservationTimestamp::Monotonic(0),
                raw: vec![1],
                value: 1.0,
                unit: "bar".to_string(),
            })
            .await;

        tick(&ctx).await;

        let published = sink.published.lock().await;
        assert_eq!(published.len(), 1);
        let body: serde_json::Value = serde_json::from_slice(&published[0].1).unwrap();
        let devices = body["devices"].as_object().unwrap();
        assert_eq!(devices.len(), 1, "ghost device's sample must be skipped");
        assert_eq!(devices[&device_id.0]["temp"]["value"], 20.0);
    }

    #[tokio::test]
    async fn publish_failure_enqueues_to_retry_queue() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, sink, config) = harness(dir.path()).await;
        let device_id = config
            .create_device(DeviceConfigInput {
                name: "PLC-1".to_string(),
                protocol: ProtocolKind::Tcp,
                transport: TransportParams::Tcp { address: "10.0.0.5".parse().unwrap(), port: 502 },
                unit_id: 1,
                refresh_period_ms: 1000,
                timeout_ms: 300,
                retry_count: 1,
                enabled: true,
            })
            .await
            .unwrap();

        ctx.observation_queue
            .enqueue(&crate::queue::Observation {
                device_id,
                register_id: RegisterId("r1".to_string()),
                register_name: "temp".to_string(),
                timestamp: crate::queue::ObservationTimestamp::Monotonic(0),
                raw: vec![1],
                value: 1.0,
                unit: "C".to_string(),
            })
            .await;

        sink.fail_next.store(true, Ordering::SeqCst);
        tick(&ctx).await;

        assert_eq!(ctx.retry_queue.pending_count().await, 1);
    }

    #[tokio::test]
    async fn disconnected_sink_sets_disconnected_state_and_skips_tick() {
        let dir = tempfile::tempdir().unwrap();
        let (ctx, sink, _config) = harness(dir.path()).await;
        sink.connected.store(false, Ordering::SeqCst);

        tick(&ctx).await;
        assert_eq!(ctx.state(), PublisherState::Disconnected);
    }

    #[test]
    fn deterministic_client_id_is_stable_for_same_seed() {
        assert_eq!(deterministic_client_id("abc"), deterministic_client_id("abc"));
        assert_ne!(deterministic_client_id("abc"), deterministic_client_id("def"));
    }
}
