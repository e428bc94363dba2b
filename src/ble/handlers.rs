//! Operation dispatch for the BLE command processor (spec section 4.8):
//! `(op, type) -> handler`, reading from / mutating C1, delegating
//! Modbus writes to C6 and OTA to the external [`OtaManager`].

use super::{BleCore, Command};
use crate::config::{DeviceConfigInput, DeviceId, LoggingConfig, RegisterConfigInput, RegisterId, ServerConfig};
use crate::error::{Domain, GatewayError, Severity};
use crate::modbus::write_register;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

/// OTA download/verify/flash, a named external collaborator (spec
/// section 1). The core only routes `op: "ota"` commands to it.
#[async_trait]
pub trait OtaManager: Send + Sync {
    async fn handle(&self, command: &Command) -> Result<Value, GatewayError>;
}

fn ok(data: Value) -> Value {
    let mut map = match data {
        Value::Object(m) => m,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut m = serde_json::Map::new();
            m.insert("data".to_string(), other);
            m
        }
    };
    map.insert("status".to_string(), json!("ok"));
    Value::Object(map)
}

fn err_response(e: &GatewayError) -> Value {
    serde_json::to_value(e.to_response()).unwrap_or_else(|_| json!({"status": "error"}))
}

fn missing_field(field: &str) -> GatewayError {
    GatewayError::new(Domain::Ble, Severity::Error, 1, format!("missing required field '{field}'"))
}

fn device_id_field(cmd: &Command) -> Result<DeviceId, GatewayError> {
    cmd.str_field("device_id").map(|s| DeviceId(s.to_string())).ok_or_else(|| missing_field("device_id"))
}

fn register_id_field(cmd: &Command) -> Result<RegisterId, GatewayError> {
    cmd.str_field("register_id").map(|s| RegisterId(s.to_string())).ok_or_else(|| missing_field("register_id"))
}

/// `page`/`limit` (default page size 10 once `page` is present) or the
/// legacy `offset`/`limit` pair (spec section 4.8).
fn paginate<T>(items: Vec<T>, cmd: &Command) -> Vec<T> {
    let page = cmd.u64_field("page").map(|p| p as usize);
    let offset = cmd.u64_field("offset").map(|o| o as usize);
    let limit = cmd.u64_field("limit").map(|l| l as usize);

    if let Some(page) = page {
        let limit = limit.unwrap_or(10);
        let start = page.saturating_sub(1).saturating_mul(limit);
        items.into_iter().skip(start).take(limit).collect()
    } else if let Some(offset) = offset {
        match limit {
            Some(limit) => items.into_iter().skip(offset).take(limit).collect(),
            None => items.into_iter().skip(offset).collect(),
        }
    } else if let Some(limit) = limit {
        items.into_iter().take(limit).collect()
    } else {
        items
    }
}

/// Every `(op, type)` pair this core can dispatch. Used by batch
/// `atomic` mode's pre-pass to verify every subcommand has a handler
/// before any of them run (spec section 4.8).
fn has_handler(op: &str, kind: &str) -> bool {
    matches!(
        (op, kind),
        ("read", "devices")
            | ("read", "devices_summary")
            | ("read", "devices_with_registers")
            | ("read", "device")
            | ("read", "registers")
            | ("read", "registers_summary")
            | ("read", "server_config")
            | ("read", "logging_config")
            | ("read", "production_mode")
            | ("read", "full_config")
            | ("read", "data")
            | ("create", "device")
            | ("create", "register")
            | ("update", "device")
            | ("update", "register")
            | ("update", "server_config")
            | ("update", "logging_config")
            | ("delete", "device")
            | ("delete", "register")
            | ("control", "enable_device")
            | ("control", "disable_device")
            | ("control", "get_device_status")
            | ("control", "get_all_device_status")
            | ("control", "set_production_mode")
            | ("control", "write_register")
            | ("system", "factory_reset")
            | ("system", "restore_config")
            | ("ota", _)
            | ("batch", _)
    )
}

pub async fn dispatch(core: Arc<BleCore>, cmd: &Command) -> Value {
    let result = dispatch_inner(&core, cmd).await;
    match result {
        Ok(value) => value,
        Err(e) => err_response(&e),
    }
}

async fn dispatch_inner(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    match (cmd.op.as_str(), cmd.kind.as_str()) {
        ("read", kind) => handle_read(core, cmd, kind).await,
        ("create", "device") => handle_create_device(core, cmd).await,
        ("create", "register") => handle_create_register(core, cmd).await,
        ("update", "device") => handle_update_device(core, cmd).await,
        ("update", "register") => handle_update_register(core, cmd).await,
        ("update", "server_config") => handle_update_server_config(core, cmd).await,
        ("update", "logging_config") => handle_update_logging_config(core, cmd).await,
        ("delete", "device") => handle_delete_device(core, cmd).await,
        ("delete", "register") => handle_delete_register(core, cmd).await,
        ("control", kind) => handle_control(core, cmd, kind).await,
        ("system", "factory_reset") => handle_factory_reset(core, cmd).await,
        ("system", "restore_config") => handle_restore_config(core, cmd).await,
        ("ota", _) => core.ota.handle(cmd).await,
        ("batch", _) => handle_batch(core, cmd).await,
        (op, kind) => Err(GatewayError::new(Domain::Ble, Severity::Error, 2, format!("no handler for op '{op}' type '{kind}'"))),
    }
}

async fn handle_read(core: &Arc<BleCore>, cmd: &Command, kind: &str) -> Result<Value, GatewayError> {
    match kind {
        "devices" => {
            let ids = core.config.list_devices().await?;
            Ok(ok(json!({ "devices": ids.iter().map(|d| d.0.clone()).collect::<Vec<_>>() })))
        }
        "devices_summary" | "devices_with_registers" => {
            let minimal = kind == "devices_summary";
            let devices = core.config.get_all_devices_with_registers(minimal).await?;
            let devices = paginate(devices, cmd);
            Ok(ok(json!({ "devices": devices })))
        }
        "device" => {
            let id = device_id_field(cmd)?;
            let mut view = core
                .config
                .read_device(&id, false)
                .await?
                .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {id} not found")))?;
            if let Some(registers) = view.registers.take() {
                let reg_offset = cmd.u64_field("reg_offset").map(|v| v as usize).unwrap_or(0);
                let reg_limit = cmd.u64_field("reg_limit").map(|v| v as usize).unwrap_or(registers.len());
                view.registers = Some(registers.into_iter().skip(reg_offset).take(reg_limit).collect());
            }
            Ok(ok(json!({ "device": view })))
        }
        "registers" => {
            let id = device_id_field(cmd)?;
            let view = core
                .config
                .read_device(&id, false)
                .await?
                .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {id} not found")))?;
            let registers = paginate(view.registers.unwrap_or_default(), cmd);
            Ok(ok(json!({ "device_id": id, "registers": registers })))
        }
        "registers_summary" => {
            let id = device_id_field(cmd)?;
            let view = core
                .config
                .read_device(&id, true)
                .await?
                .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {id} not found")))?;
            Ok(ok(json!({ "device_id": id, "register_count": view.register_count.unwrap_or(0) })))
        }
        "server_config" => Ok(ok(json!({ "server_config": core.config.get_server_config().await? }))),
        "logging_config" => Ok(ok(json!({ "logging_config": core.config.get_logging_config().await? }))),
        "production_mode" => Ok(ok(json!({ "production_mode": core.config.get_logging_config().await?.production_mode }))),
        "full_config" => handle_full_config(core, cmd).await,
        "data" => handle_data_stream(core, cmd).await,
        other => Err(GatewayError::new(Domain::Ble, Severity::Error, 2, format!("unknown read type '{other}'"))),
    }
}

async fn handle_full_config(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let section = cmd.str_field("section").unwrap_or("all");
    let mut out = serde_json::Map::new();

    if section == "all" || section == "devices" {
        let devices = paginate(core.config.get_all_devices_with_registers(false).await?, cmd);
        out.insert("devices".to_string(), json!(devices));
    }
    if section == "all" || section == "server_config" {
        out.insert("server_config".to_string(), json!(core.config.get_server_config().await?));
    }
    if section == "all" || section == "logging_config" {
        out.insert("logging_config".to_string(), json!(core.config.get_logging_config().await?));
    }
    if section == "all" || section == "metadata" {
        out.insert("metadata".to_string(), json!({ "firmware_version": env!("CARGO_PKG_VERSION") }));
    }
    if out.is_empty() {
        return Err(GatewayError::invalid_config(format!("unknown full_config section '{section}'")));
    }
    Ok(ok(Value::Object(out)))
}

/// Starts or stops a streaming session for one device (spec section
/// 4.8). Frame emission (`{"status":"data","data":{...}}`, spec section
/// 6) happens out of band: the coordinator subscribes to every observation
/// C6 produces and forwards the ones whose `device_id` is in
/// `core.streaming` through `ble_transport.notify` while the session is
/// active. This handler only flips the session flag.
async fn handle_data_stream(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let id = device_id_field(cmd)?;
    let action = cmd.str_field("action").unwrap_or("start");
    let mut streaming = core.streaming.lock().await;
    let active = match action {
        "stop" => {
            streaming.remove(&id);
            false
        }
        _ => {
            streaming.insert(id.clone());
            true
        }
    };
    Ok(ok(json!({ "device_id": id, "streaming": active })))
}

async fn handle_create_device(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let input: DeviceConfigInput = serde_json::from_value(cmd.payload.clone())
        .map_err(|e| GatewayError::invalid_config(format!("invalid device config: {e}")))?;
    let id = core.config.create_device(input).await?;
    core.config.notify_all_services();
    Ok(ok(json!({ "device_id": id })))
}

async fn handle_create_register(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let device_id = device_id_field(cmd)?;
    let input: RegisterConfigInput = serde_json::from_value(cmd.payload.clone())
        .map_err(|e| GatewayError::invalid_config(format!("invalid register config: {e}")))?;
    let id = core.config.create_register(&device_id, input).await?;
    core.config.notify_all_services();
    Ok(ok(json!({ "device_id": device_id, "register_id": id })))
}

async fn handle_update_device(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let device_id = device_id_field(cmd)?;
    let input: DeviceConfigInput = serde_json::from_value(cmd.payload.clone())
        .map_err(|e| GatewayError::invalid_config(format!("invalid device config: {e}")))?;
    core.config.update_device(&device_id, input).await?;
    core.config.notify_all_services();
    Ok(ok(json!({ "device_id": device_id })))
}

async fn handle_update_register(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let device_id = device_id_field(cmd)?;
    let register_id = register_id_field(cmd)?;
    let input: RegisterConfigInput = serde_json::from_value(cmd.payload.clone())
        .map_err(|e| GatewayError::invalid_config(format!("invalid register config: {e}")))?;
    core.config.update_register(&device_id, &register_id, input).await?;
    core.config.notify_all_services();
    Ok(ok(json!({ "device_id": device_id, "register_id": register_id })))
}

async fn handle_update_server_config(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let config: ServerConfig =
        serde_json::from_value(cmd.payload.clone()).map_err(|e| GatewayError::invalid_config(format!("invalid server config: {e}")))?;
    core.config.update_server_config(config).await?;
    core.config.notify_all_services();
    Ok(ok(Value::Null))
}

async fn handle_update_logging_config(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let config: LoggingConfig =
        serde_json::from_value(cmd.payload.clone()).map_err(|e| GatewayError::invalid_config(format!("invalid logging config: {e}")))?;
    core.config.update_logging_config(config).await?;
    core.config.notify_all_services();
    Ok(ok(Value::Null))
}

async fn handle_delete_device(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let device_id = device_id_field(cmd)?;
    core.config.delete_device(&device_id).await?;
    core.config.notify_all_services();
    core.health.lock().await.remove(&device_id);
    core.streaming.lock().await.remove(&device_id);
    Ok(ok(json!({ "device_id": device_id })))
}

async fn handle_delete_register(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let device_id = device_id_field(cmd)?;
    let register_id = register_id_field(cmd)?;
    core.config.delete_register(&device_id, &register_id).await?;
    core.config.notify_all_services();
    Ok(ok(json!({ "device_id": device_id, "register_id": register_id })))
}

async fn handle_control(core: &Arc<BleCore>, cmd: &Command, kind: &str) -> Result<Value, GatewayError> {
    match kind {
        "enable_device" => set_device_enabled(core, cmd, true).await,
        "disable_device" => set_device_enabled(core, cmd, false).await,
        "get_device_status" => {
            let id = device_id_field(cmd)?;
            let health = core.health.lock().await;
            let status = health.get(&id).cloned().unwrap_or_default();
            Ok(ok(json!({ "device_id": id, "status": status })))
        }
        "get_all_device_status" => {
            let health = core.health.lock().await;
            let statuses: serde_json::Map<String, Value> = health.iter().map(|(id, h)| (id.0.clone(), json!(h))).collect();
            Ok(ok(json!({ "statuses": statuses })))
        }
        "set_production_mode" => {
            let enabled = cmd.payload.get("production_mode").and_then(Value::as_bool).unwrap_or(false);
            let mut logging = core.config.get_logging_config().await?;
            logging.production_mode = enabled as u8;
            core.config.update_logging_config(logging).await?;
            core.config.notify_all_services();
            Ok(ok(json!({ "production_mode": enabled })))
        }
        "write_register" => handle_write_register(core, cmd).await,
        other => Err(GatewayError::new(Domain::Ble, Severity::Error, 2, format!("unknown control type '{other}'"))),
    }
}

async fn set_device_enabled(core: &Arc<BleCore>, cmd: &Command, enabled: bool) -> Result<Value, GatewayError> {
    let device_id = device_id_field(cmd)?;
    let view = core
        .config
        .read_device(&device_id, true)
        .await?
        .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {device_id} not found")))?;
    let input = DeviceConfigInput {
        name: view.name,
        protocol: view.protocol,
        transport: view.transport,
        unit_id: view.unit_id,
        refresh_period_ms: view.refresh_period_ms,
        timeout_ms: view.timeout_ms,
        retry_count: view.retry_count,
        enabled,
    };
    core.config.update_device(&device_id, input).await?;
    core.config.notify_all_services();
    Ok(ok(json!({ "device_id": device_id, "enabled": enabled })))
}

/// Named in spec section 4.6 as a BLE-triggered write, dispatched
/// through C8 (spec section 4.8 operation table only sketches `control`
/// types, this is the one with transport side effects).
async fn handle_write_register(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let device_id = device_id_field(cmd)?;
    let register_id = register_id_field(cmd)?;
    let value = cmd.payload.get("value").and_then(Value::as_f64).ok_or_else(|| missing_field("value"))?;

    let view = core
        .config
        .read_device(&device_id, false)
        .await?
        .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("device {device_id} not found")))?;
    let registers = view.registers.unwrap_or_default();
    let register = registers
        .iter()
        .find(|r| r.register_id == register_id)
        .ok_or_else(|| GatewayError::not_found(Domain::Config, format!("register {register_id} not found")))?;

    if !register.write_policy.as_ref().map(|p| p.writable).unwrap_or(false) {
        return Err(GatewayError::invalid_config(format!("register {register_id} is not writable")));
    }
    if let Some(policy) = &register.write_policy {
        if let Some(min) = policy.min_value {
            if value < min {
                return Err(GatewayError::invalid_config(format!("value {value} below minimum {min}")));
            }
        }
        if let Some(max) = policy.max_value {
            if value > max {
                return Err(GatewayError::invalid_config(format!("value {value} above maximum {max}")));
            }
        }
    }

    let device = crate::config::Device {
        device_id: device_id.clone(),
        name: view.name,
        protocol: view.protocol,
        transport: view.transport,
        unit_id: view.unit_id,
        refresh_period_ms: view.refresh_period_ms,
        timeout_ms: view.timeout_ms,
        retry_count: view.retry_count,
        enabled: view.enabled,
        registers: registers.clone(),
    };

    write_register(core.transport_factory.as_ref(), &device, register, value)
        .await
        .map_err(|e| GatewayError::new(Domain::Modbus, Severity::Error, 1, format!("write failed: {e}")))?;

    Ok(ok(json!({ "device_id": device_id, "register_id": register_id, "value": value })))
}

async fn handle_factory_reset(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let reason = cmd.str_field("reason").unwrap_or("unspecified").to_string();
    let actor = cmd.str_field("actor").unwrap_or("ble").to_string();
    let result = core.config.clear_all_configurations().await;
    core.config.notify_all_services();

    let outcome = if result.is_ok() { "SUCCESS" } else { "FAIL" };
    let line = format!("{}|{}|{}|{}\n", core.clock.monotonic_millis(), reason, actor, outcome);
    let audit_path = core.fs_root.join("factory_reset_audit.log");
    append_audit_line(&audit_path, &line).await;

    result?;
    Ok(ok(json!({ "reset": true })))
}

async fn append_audit_line(path: &std::path::Path, line: &str) {
    use tokio::io::AsyncWriteExt;
    match tokio::fs::OpenOptions::new().create(true).append(true).open(path).await {
        Ok(mut file) => {
            if let Err(e) = file.write_all(line.as_bytes()).await {
                tracing::warn!(target: "ble", "failed to append factory reset audit line: {e}");
            }
        }
        Err(e) => tracing::warn!(target: "ble", "failed to open factory reset audit log: {e}"),
    }
}

/// Restores a previously backed-up configuration (spec section 8
/// round-trip property: "config backup via `full_config(section=all)`
/// followed by `restore_config` yields an equivalent inventory"). Device
/// ids are always regenerated, never taken from the backup (spec
/// section 9 design note on caller-supplied ids).
async fn handle_restore_config(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let devices = cmd.payload.get("devices").and_then(Value::as_array).cloned().unwrap_or_default();
    let mut restored_ids = Vec::new();

    for device_json in devices {
        let Some(obj) = device_json.as_object() else { continue };
        let device_input = DeviceConfigInput {
            name: obj.get("name").and_then(Value::as_str).unwrap_or("restored-device").to_string(),
            protocol: serde_json::from_value(obj.get("protocol").cloned().unwrap_or(json!("tcp")))
                .map_err(|e| GatewayError::invalid_config(format!("invalid protocol in restore payload: {e}")))?,
            transport: serde_json::from_value(obj.get("transport").cloned().unwrap_or(json!(null)))
                .map_err(|e| GatewayError::invalid_config(format!("invalid transport in restore payload: {e}")))?,
            unit_id: obj.get("unit_id").and_then(Value::as_u64).unwrap_or(1) as u8,
            refresh_period_ms: obj.get("refresh_period_ms").and_then(Value::as_u64).unwrap_or(1000),
            timeout_ms: obj.get("timeout_ms").and_then(Value::as_u64).unwrap_or(1000),
            retry_count: obj.get("retry_count").and_then(Value::as_u64).unwrap_or(3) as u8,
            enabled: obj.get("enabled").and_then(Value::as_bool).unwrap_or(true),
        };
        let new_id = core.config.create_device(device_input).await?;

        if let Some(registers) = obj.get("registers").and_then(Value::as_array) {
            for register_json in registers {
                if let Ok(input) = serde_json::from_value::<RegisterConfigInput>(register_json.clone()) {
                    let _ = core.config.create_register(&new_id, input).await;
                }
            }
        }
        restored_ids.push(new_id);
    }

    if let Some(server) = cmd.payload.get("server_config") {
        if let Ok(config) = serde_json::from_value::<ServerConfig>(server.clone()) {
            core.config.update_server_config(config).await?;
        }
    }
    if let Some(logging) = cmd.payload.get("logging_config") {
        if let Ok(config) = serde_json::from_value::<LoggingConfig>(logging.clone()) {
            core.config.update_logging_config(config).await?;
        }
    }

    core.config.notify_all_services();
    Ok(ok(json!({ "restored_devices": restored_ids })))
}

/// Batch dispatch (spec section 4.8): `sequential` runs in order and
/// counts outcomes; `atomic` pre-verifies every subcommand has a
/// handler and aborts with no side effects if any doesn't (still no
/// true rollback once execution starts — documented, not implemented,
/// per spec section 9 design note); `parallel` runs every subcommand
/// concurrently, best-effort, same no-rollback caveat.
async fn handle_batch(core: &Arc<BleCore>, cmd: &Command) -> Result<Value, GatewayError> {
    let mode = cmd.str_field("mode").unwrap_or("sequential").to_string();
    let raw_commands = cmd.payload.get("commands").and_then(Value::as_array).cloned().unwrap_or_default();

    let mut subcommands = Vec::with_capacity(raw_commands.len());
    for (idx, sub) in raw_commands.iter().enumerate() {
        let op = sub.get("op").and_then(Value::as_str).unwrap_or_default().to_string();
        let kind = sub.get("type").and_then(Value::as_str).unwrap_or_default().to_string();
        subcommands.push(Command { id: cmd.id * 1000 + idx as u64, op, kind, priority: cmd.priority, payload: sub.clone(), enqueued_at_ms: cmd.enqueued_at_ms });
    }

    if mode == "atomic" {
        if let Some(missing) = subcommands.iter().find(|c| !has_handler(&c.op, &c.kind)) {
            return Err(GatewayError::new(
                Domain::Ble,
                Severity::Error,
                3,
                format!("atomic batch aborted: no handler for op '{}' type '{}'", missing.op, missing.kind),
            ));
        }
    }

    let results: Vec<Value> = if mode == "parallel" {
        let mut set = tokio::task::JoinSet::new();
        for sub in subcommands {
            let core = core.clone();
            set.spawn(async move { dispatch_inner(&core, &sub).await });
        }
        let mut out = Vec::new();
        while let Some(joined) = set.join_next().await {
            out.push(match joined {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => err_response(&e),
                Err(e) => err_response(&GatewayError::new(Domain::System, Severity::Error, 1, format!("subcommand task panicked: {e}"))),
            });
        }
        out
    } else {
        let mut out = Vec::with_capacity(subcommands.len());
        for sub in &subcommands {
            out.push(match dispatch_inner(core, sub).await {
                Ok(v) => v,
                Err(e) => err_response(&e),
            });
        }
        out
    };

    let succeeded = results.iter().filter(|r| r.get("status").and_then(Value::as_str) == Some("ok")).count();
    let failed = results.len() - succeeded;

    Ok(ok(json!({ "mode": mode, "succeeded": succeeded, "failed": failed, "results": results })))
}
