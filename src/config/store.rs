//! The Configuration Store (C1): atomic WAL-protected persistence plus a
//! two-copy cache (mutable primary + read-only shadow snapshot) so C6/C7
//! read paths never block behind a writer (spec section 4.1, section 9
//! "two-copy cache replaces mutex-protected reads").

use super::model::*;
use super::wal::{fnv1a_hash, Wal};
use crate::clock::Clock;
use crate::error::{Domain, GatewayError};
use crate::settings::GatewaySettings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::timeout;

const READ_LOCK_TIMEOUT: Duration = Duration::from_millis(100);
const WRITE_LOCK_TIMEOUT: Duration = Duration::from_secs(2);
const FILE_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_ID_COLLISION_RETRIES: usize = 5;

#[derive(Debug, Clone, Default)]
struct ConfigState {
    devices: DeviceInventory,
    server: ServerConfig,
    logging: LoggingConfig,
}

struct Inner {
    primary: ConfigState,
    shadow: Arc<ConfigState>,
    loaded_at: Instant,
    dirty: bool,
}

/// Lifecycle events a consumer (Coordinator, C2, C6, C7) may care about
/// beyond the plain change token.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    DeviceDeleted(DeviceId),
    ConfigChanged,
}

pub struct ConfigStore {
    fs_root: PathBuf,
    cache_ttl: Duration,
    inner: Mutex<Inner>,
    file_mutex: Mutex<()>,
    wal: Wal,
    change_tx: watch::Sender<u64>,
    change_rx: watch::Receiver<u64>,
    event_tx: broadcast::Sender<ConfigEvent>,
    clock: Arc<dyn Clock>,
    known_device_ids: Mutex<std::collections::HashSet<DeviceId>>,
}

impl ConfigStore {
    /// Mount the store: load on-disk state, run WAL recovery (spec
    /// section 4.1, section 8 scenario 6), and build the first shadow
    /// snapshot.
    pub async fn mount(settings: &GatewaySettings, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let fs_root = settings.fs_root.clone();
        std::fs::create_dir_all(&fs_root)?;
        let wal = Wal::new(fs_root.join("config.wal"));

        let recovered = wal.recover()?;
        if recovered > 0 {
            tracing::warn!("WAL recovery touched {} entries on mount", recovered);
        }
        wal.truncate_completed()?;

        let state = Self::load_from_disk(&fs_root)?;
        let mut known_ids: std::collections::HashSet<DeviceId> = state.devices.keys().cloned().collect();
        // A tombstone file preserves ids across deletion (spec section 3
        // invariant: device ids are never reused).
        let tombstones = Self::load_tombstones(&fs_root);
        known_ids.extend(tombstones);

        let (change_tx, change_rx) = watch::channel(0u64);
        let (event_tx, _) = broadcast::channel(64);

        Ok(Self {
            fs_root,
            cache_ttl: Duration::from_secs(settings.cache_ttl_secs),
            inner: Mutex::new(Inner {
                shadow: Arc::new(state.clone()),
                primary: state,
                loaded_at: Instant::now(),
                dirty: false,
            }),
            file_mutex: Mutex::new(()),
            wal,
            change_tx,
            change_rx,
            event_tx,
            clock,
            known_device_ids: Mutex::new(known_ids),
        })
    }

    fn devices_path(fs_root: &std::path::Path) -> PathBuf {
        fs_root.join("devices.json")
    }
    fn server_config_path(fs_root: &std::path::Path) -> PathBuf {
        fs_root.join("server_config.json")
    }
    fn logging_config_path(fs_root: &std::path::Path) -> PathBuf {
        fs_root.join("logging_config.json")
    }
    fn tombstones_path(fs_root: &std::path::Path) -> PathBuf {
        fs_root.join(".device_id_tombstones.json")
    }

    fn load_from_disk(fs_root: &std::path::Path) -> anyhow::Result<ConfigState> {
        let devices = Self::read_json_or_default(&Self::devices_path(fs_root))?;
        let server = Self::read_json_or_default(&Self::server_config_path(fs_root))?;
        let logging = Self::read_json_or_default(&Self::logging_config_path(fs_root))?;
        Ok(ConfigState { devices, server, logging })
    }

    fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(path: &std::path::Path) -> anyhow::Result<T> {
        if !path.exists() {
            return Ok(T::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn load_tombstones(fs_root: &std::path::Path) -> Vec<DeviceId> {
        let path = Self::tombstones_path(fs_root);
        if !path.exists() {
            return vec![];
        }
        std::fs::read_to_string(&path)
            .ok()
            .and_then(|c| serde_json::from_str::<Vec<DeviceId>>(&c).ok())
            .unwrap_or_default()
    }

    async fn save_tombstones(&self, ids: &std::collections::HashSet<DeviceId>) -> Result<(), GatewayError> {
        let list: Vec<&DeviceId> = ids.iter().collect();
        let bytes = serde_json::to_vec_pretty(&list).unwrap_or_default();
        self.write_atomic(&Self::tombstones_path(&self.fs_root), &bytes).await
    }

    /// Atomic-write protocol (spec section 4.1): WAL begin -> write temp
    /// -> rename -> WAL complete. `file_mutex` is held only for the
    /// duration of this function, never across subsequent cache work.
    async fn write_atomic(&self, target: &std::path::Path, bytes: &[u8]) -> Result<(), GatewayError> {
        let _file_guard = timeout(FILE_LOCK_TIMEOUT, self.file_mutex.lock())
            .await
            .map_err(|_| GatewayError::busy(Domain::Config, "timed out acquiring file mutex"))?;

        let tmp = target.with_extension("json.tmp");
        let hash = fnv1a_hash(bytes);
        let now = self.clock.monotonic_millis() as i64;

        let idx = self
            .wal
            .begin("write", target, &tmp, now, hash)
            .map_err(|e| GatewayError::persist_failure(format!("WAL append failed: {e}")))?;

        std::fs::write(&tmp, bytes).map_err(|e| GatewayError::persist_failure(format!("temp write failed: {e}")))?;
        std::fs::rename(&tmp, target).map_err(|e| GatewayError::persist_failure(format!("rename failed: {e}")))?;

        self.wal
            .complete(idx)
            .map_err(|e| GatewayError::persist_failure(format!("WAL complete failed: {e}")))?;
        Ok(())
    }

    /// Reload the primary cache from disk unconditionally, used both for
    /// the read-lock-timeout fallback and for TTL/dirty-triggered reload.
    fn reload_from_disk(&self) -> Result<ConfigState, GatewayError> {
        Self::load_from_disk(&self.fs_root).map_err(|e| GatewayError::persist_failure(format!("reload failed: {e}")))
    }

    fn needs_reload(&self, inner: &Inner) -> bool {
        inner.dirty || inner.loaded_at.elapsed() > self.cache_ttl
    }

    /// Acquire a read-only snapshot. Bounded 100ms wait; on timeout, falls
    /// back to a full disk reload rather than blocking (spec section 4.1).
    async fn snapshot(&self) -> Result<Arc<ConfigState>, GatewayError> {
        match timeout(READ_LOCK_TIMEOUT, self.inner.lock()).await {
            Ok(mut guard) => {
                if self.needs_reload(&guard) {
                    let fresh = self.reload_from_disk()?;
                    guard.shadow = Arc::new(fresh.clone());
                    guard.primary = fresh;
                    guard.loaded_at = Instant::now();
                    guard.dirty = false;
                }
                Ok(guard.shadow.clone())
            }
            Err(_) => {
                tracing::warn!("config read lock timed out, falling back to full reload");
                Ok(Arc::new(self.reload_from_disk()?))
            }
        }
    }

    /// Run a mutation against a fresh copy of the primary state; on
    /// success, persist then swap the shadow atomically; on failure,
    /// leave primary intact but mark it dirty (spec section 4.1
    /// invalidation rule).
    async fn mutate<T>(
        &self,
        persist: PersistTarget,
        f: impl FnOnce(&mut ConfigState) -> Result<T, GatewayError>,
    ) -> Result<T, GatewayError> {
        let mut guard = timeout(WRITE_LOCK_TIMEOUT, self.inner.lock())
            .await
            .map_err(|_| GatewayError::busy(Domain::Config, "timed out acquiring config write lock"))?;

        if self.needs_reload(&guard) {
            let fresh = self.reload_from_disk()?;
            guard.primary = fresh;
            guard.loaded_at = Instant::now();
            guard.dirty = false;
        }

        let mut working = guard.primary.clone();
        let result = f(&mut working)?;

        let persist_result = self.persist_target(persist, &working).await;
        match persist_result {
            Ok(()) => {
                guard.primary = working.clone();
                guard.shadow = Arc::new(working);
                guard.loaded_at = Instant::now();
                guard.dirty = false;
                Ok(result)
            }
            Err(e) => {
                guard.dirty = true;
                Err(e)
            }
        }
    }

    async fn persist_target(&self, target: PersistTarget, state: &ConfigState) -> Result<(), GatewayError> {
        match target {
            PersistTarget::Devices => {
                let bytes = serde_json::to_vec_pretty(&state.devices).unwrap_or_default();
                self.write_atomic(&Self::devices_path(&self.fs_root), &bytes).await
            }
            PersistTarget::ServerConfig => {
                let bytes = serde_json::to_vec_pretty(&state.server).unwrap_or_default();
                self.write_atomic(&Self::server_config_path(&self.fs_root), &bytes).await
            }
            PersistTarget::LoggingConfig => {
                let bytes = serde_json::to_vec_pretty(&state.logging).unwrap_or_default();
                self.write_atomic(&Self::logging_config_path(&self.fs_root), &bytes).await
            }
            PersistTarget::All => {
                self.persist_target(PersistTarget::Devices, state).await?;
                self.persist_target(PersistTarget::ServerConfig, state).await?;
                self.persist_target(PersistTarget::LoggingConfig, state).await
            }
        }
    }

    // ---- public contract (spec section 4.1) ----

    pub async fn list_devices(&self) -> Result<Vec<DeviceId>, GatewayError> {
        Ok(self.snapshot().await?.devices.keys().cloned().collect())
    }

    pub async fn read_device(&self, id: &DeviceId, minimal: bool) -> Result<Option<DeviceView>, GatewayError> {
        let snap = self.snapshot().await?;
        Ok(snap.devices.get(id).map(|d| if minimal { d.minimal_view() } else { d.full_view() }))
    }

    pub async fn get_all_devices_with_registers(&self, minimal: bool) -> Result<Vec<DeviceView>, GatewayError> {
        let snap = self.snapshot().await?;
        Ok(snap
            .devices
            .values()
            .map(|d| if minimal { d.minimal_view() } else { d.full_view() })
            .collect())
    }

    pub async fn create_device(&self, input: DeviceConfigInput) -> Result<DeviceId, GatewayError> {
        if input.name.trim().is_empty() {
            return Err(GatewayError::invalid_config("device name is required"));
        }

        let mut known = self.known_device_ids.lock().await;
        let mut new_id = None;
        for _ in 0..MAX_ID_COLLISION_RETRIES {
            let candidate = generate_device_id();
            if !known.contains(&candidate) {
                new_id = Some(candidate);
                break;
            }
        }
        let id = new_id.ok_or_else(|| {
            GatewayError::new(Domain::Config, crate::error::Severity::Critical, 5, "exhausted id generation retries")
        })?;
        known.insert(id.clone());
        drop(known);

        let device = Device {
            device_id: id.clone(),
            name: input.name,
            protocol: input.protocol,
            transport: input.transport,
            unit_id: input.unit_id,
            refresh_period_ms: input.refresh_period_ms,
            timeout_ms: input.timeout_ms,
            retry_count: input.retry_count,
            enabled: input.enabled,
            registers: vec![],
        };

        let result = self
            .mutate(PersistTarget::Devices, |state| {
                state.devices.insert(id.clone(), device.clone());
                Ok(id.clone())
            })
            .await;

        if result.is_err() {
            // mutation failed, free the id back up so it isn't wasted forever
            self.known_device_ids.lock().await.remove(&id);
        }
        result
    }

    pub async fn update_device(&self, id: &DeviceId, input: DeviceConfigInput) -> Result<(), GatewayError> {
        let id = id.clone();
        self.mutate(PersistTarget::Devices, move |state| {
            let device = state
                .devices
                .get_mut(&id)
                .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {id} not found")))?;
            device.name = input.name;
            device.protocol = input.protocol;
            device.transport = input.transport;
            device.unit_id = input.unit_id;
            device.refresh_period_ms = input.refresh_period_ms;
            device.timeout_ms = input.timeout_ms;
            device.retry_count = input.retry_count;
            device.enabled = input.enabled;
            Ok(())
        })
        .await
    }

    pub async fn delete_device(&self, id: &DeviceId) -> Result<(), GatewayError> {
        let target_id = id.clone();
        self.mutate(PersistTarget::Devices, move |state| {
            state
                .devices
                .remove(&target_id)
                .map(|_| ())
                .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {target_id} not found")))
        })
        .await?;

        let _ = self.event_tx.send(ConfigEvent::DeviceDeleted(id.clone()));
        let known = self.known_device_ids.lock().await;
        let _ = self.save_tombstones(&known).await;
        Ok(())
    }

    pub async fn create_register(&self, device_id: &DeviceId, input: RegisterConfigInput) -> Result<RegisterId, GatewayError> {
        let device_id = device_id.clone();
        let new_id = generate_register_id();
        let assigned = new_id.clone();

        self.mutate(PersistTarget::Devices, move |state| {
            let device = state
                .devices
                .get_mut(&device_id)
                .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {device_id} not found")))?;

            if device.registers.iter().any(|r| r.address == input.address) {
                return Err(GatewayError::duplicate_address(format!(
                    "address {} already used on device {device_id}",
                    input.address
                )));
            }

            let register = Register {
                register_id: new_id.clone(),
                register_index: (device.registers.len() + 1) as u32,
                name: input.name,
                address: input.address,
                function_code: input.function_code,
                data_type: input.data_type,
                scale: input.scale.unwrap_or(1.0),
                offset: input.offset.unwrap_or(0.0),
                decimals: clamp_decimals(input.decimals.unwrap_or(-1)),
                unit: input.unit.unwrap_or_default(),
                write_policy: input.write_policy,
                mqtt_override: input.mqtt_override,
            };
            device.registers.push(register);
            Ok(())
        })
        .await?;

        Ok(assigned)
    }

    pub async fn update_register(
        &self,
        device_id: &DeviceId,
        register_id: &RegisterId,
        input: RegisterConfigInput,
    ) -> Result<(), GatewayError> {
        let device_id = device_id.clone();
        let register_id = register_id.clone();

        self.mutate(PersistTarget::Devices, move |state| {
            let device = state
                .devices
                .get_mut(&device_id)
                .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {device_id} not found")))?;

            if device
                .registers
                .iter()
                .any(|r| r.register_id != register_id && r.address == input.address)
            {
                return Err(GatewayError::duplicate_address(format!(
                    "address {} collides with a sibling register",
                    input.address
                )));
            }

            let register = device
                .registers
                .iter_mut()
                .find(|r| r.register_id == register_id)
                .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("register {register_id} not found")))?;

            register.name = input.name;
            register.address = input.address;
            register.function_code = input.function_code;
            register.data_type = input.data_type;
            register.scale = input.scale.unwrap_or(1.0);
            register.offset = input.offset.unwrap_or(0.0);
            register.decimals = clamp_decimals(input.decimals.unwrap_or(-1));
            register.unit = input.unit.unwrap_or_default();
            register.write_policy = input.write_policy;
            register.mqtt_override = input.mqtt_override;
            Ok(())
        })
        .await
    }

    pub async fn delete_register(&self, device_id: &DeviceId, register_id: &RegisterId) -> Result<(), GatewayError> {
        let device_id = device_id.clone();
        let register_id = register_id.clone();

        self.mutate(PersistTarget::Devices, move |state| {
            let device = state
                .devices
                .get_mut(&device_id)
                .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {device_id} not found")))?;

            let before = device.registers.len();
            device.registers.retain(|r| r.register_id != register_id);
            if device.registers.len() == before {
                return Err(GatewayError::not_found(Domain::Config, format!("register {register_id} not found")));
            }
            device.renumber_registers();
            Ok(())
        })
        .await
    }

    pub async fn get_server_config(&self) -> Result<ServerConfig, GatewayError> {
        Ok(self.snapshot().await?.server.clone())
    }

    pub async fn update_server_config(&self, config: ServerConfig) -> Result<(), GatewayError> {
        self.mutate(PersistTarget::ServerConfig, move |state| {
            state.server = config.clone();
            Ok(())
        })
        .await
    }

    pub async fn get_logging_config(&self) -> Result<LoggingConfig, GatewayError> {
        Ok(self.snapshot().await?.logging.clone())
    }

    pub async fn update_logging_config(&self, config: LoggingConfig) -> Result<(), GatewayError> {
        self.mutate(PersistTarget::LoggingConfig, move |state| {
            state.logging = config.clone();
            Ok(())
        })
        .await
    }

    pub async fn clear_all_configurations(&self) -> Result<(), GatewayError> {
        self.mutate(PersistTarget::All, |state| {
            state.devices.clear();
            state.server = ServerConfig::default();
            state.logging = LoggingConfig::default();
            Ok(())
        })
        .await
    }

    /// Broadcast a changed token; consumers poll it between cycles
    /// (spec section 4.1, section 4.8 mutation handlers).
    pub fn notify_all_services(&self) {
        let next = *self.change_rx.borrow() + 1;
        let _ = self.change_tx.send(next);
        let _ = self.event_tx.send(ConfigEvent::ConfigChanged);
    }

    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.change_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConfigEvent> {
        self.event_tx.subscribe()
    }

    pub fn change_token(&self) -> u64 {
        *self.change_rx.borrow()
    }
}

#[derive(Debug, Clone, Copy)]
enum PersistTarget {
    Devices,
    ServerConfig,
    LoggingConfig,
    All,
}
