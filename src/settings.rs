//! Gateway bootstrap settings — distinct from the persistent Device/Server
//! configuration store (C1, `config::store`). This is the handful of
//! parameters the gateway needs before C1 can even mount: where the
//! filesystem root lives, and the default sizes/intervals for the
//! supervisory components.
//!
//! Loading follows the teacher's `config::load_config` shape: an env var
//! names the file, missing file falls back to defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewaySettings {
    /// Root directory standing in for the on-device flash filesystem.
    pub fs_root: PathBuf,
    pub observation_queue_capacity: usize,
    pub retry_queue_capacity: usize,
    pub retry_ttl_hours: i64,
    pub cache_ttl_secs: u64,
    pub memory_tick_secs: u64,
    pub network_probe_secs: u64,
    pub failover_delay_ms: u64,
    pub hysteresis_ms: u64,
    pub ble_queue_depth: usize,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            fs_root: PathBuf::from("."),
            observation_queue_capacity: 100,
            retry_queue_capacity: 100,
            retry_ttl_hours: 24,
            cache_ttl_secs: 600,
            memory_tick_secs: 5,
            network_probe_secs: 5,
            failover_delay_ms: 1000,
            hysteresis_ms: 10_000,
            ble_queue_depth: 32,
        }
    }
}

impl GatewaySettings {
    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.fs_root.join(file_name)
    }
}

/// Load bootstrap settings from file or use defaults, mirroring the
/// teacher's `load_config` (`FIELDBRIDGE_CONFIG`, default `gateway.json`).
pub fn load_settings() -> Result<GatewaySettings> {
    let path = std::env::var("FIELDBRIDGE_CONFIG").unwrap_or_else(|_| "gateway.json".to_string());

    if Path::new(&path).exists() {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read gateway settings file: {}", path))?;
        let settings: GatewaySettings =
            serde_json::from_str(&content).with_context(|| "failed to parse gateway settings file")?;
        Ok(settings)
    } else {
        tracing::warn!("gateway settings file not found, using defaults");
        Ok(GatewaySettings::default())
    }
}
