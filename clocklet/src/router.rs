//! Command surface exposed to the interface layer.
//!
//! One method per worker capability, each a 1:1 translation into a single
//! bridge call. Parameter shapes are validated here, before dispatch;
//! malformed input never reaches the worker. No aggregation, no retry.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::bridge::{Bridge, CallError};
use crate::config::{ConfigError, ConfigStore};
use crate::scheduler::SyncScheduler;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// Input failed shape validation and was never dispatched.
    #[error("invalid {field}: {reason}")]
    Validation { field: &'static str, reason: String },

    #[error(transparent)]
    Bridge(#[from] CallError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to encode parameters: {0}")]
    Encode(#[from] serde_json::Error),
}

fn invalid(field: &'static str, reason: impl Into<String>) -> CommandError {
    CommandError::Validation {
        field,
        reason: reason.into(),
    }
}

/// Which direction punches from a device map to in ERPNext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PunchDirection {
    In,
    Out,
    Auto,
}

fn default_device_port() -> u16 {
    4370
}

fn default_true() -> bool {
    true
}

/// A biometric device record as the worker stores it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceDraft {
    pub name: String,
    pub ip: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub punch_direction: Option<PunchDirection>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceUpdate {
    pub id: i64,
    #[serde(flatten)]
    pub device: DeviceDraft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceProbe {
    pub ip: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftDraft {
    pub name: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub erpnext_shift_type: Option<String>,
    #[serde(default)]
    pub device_ids: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShiftUpdate {
    pub id: i64,
    #[serde(flatten)]
    pub shift: ShiftDraft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryQuery {
    pub page: u64,
    pub limit: u64,
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self { page: 1, limit: 20 }
    }
}

/// Attendance log filter. Field names follow the worker's wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogQuery {
    pub page: u64,
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<String>,
}

impl Default for LogQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 20,
            search: None,
            status: None,
            device_id: None,
            date_from: None,
            date_to: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErpnextProbe {
    pub url: String,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default = "default_erpnext_version")]
    pub version: u32,
}

fn default_erpnext_version() -> u32 {
    15
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Detailed,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub report_type: ReportType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<i64>,
}

/// Named commands over the worker, the scheduler, and the config store.
pub struct CommandRouter {
    bridge: Arc<Bridge>,
    scheduler: Arc<SyncScheduler>,
    store: Arc<dyn ConfigStore>,
}

impl CommandRouter {
    pub fn new(
        bridge: Arc<Bridge>,
        scheduler: Arc<SyncScheduler>,
        store: Arc<dyn ConfigStore>,
    ) -> Self {
        Self {
            bridge,
            scheduler,
            store,
        }
    }

    // Devices

    pub async fn list_devices(&self) -> Result<Value, CommandError> {
        Ok(self.bridge.call("get_devices", json!({})).await?)
    }

    pub async fn add_device(&self, device: DeviceDraft) -> Result<Value, CommandError> {
        validate_device(&device)?;
        Ok(self
            .bridge
            .call("add_device", serde_json::to_value(&device)?)
            .await?)
    }

    pub async fn update_device(&self, update: DeviceUpdate) -> Result<Value, CommandError> {
        validate_device(&update.device)?;
        Ok(self
            .bridge
            .call("update_device", serde_json::to_value(&update)?)
            .await?)
    }

    pub async fn delete_device(&self, id: i64) -> Result<Value, CommandError> {
        Ok(self.bridge.call("delete_device", json!({ "id": id })).await?)
    }

    pub async fn test_device_connection(&self, probe: DeviceProbe) -> Result<Value, CommandError> {
        validate_address(&probe.ip)?;
        validate_port(probe.port)?;
        Ok(self
            .bridge
            .call("test_device_connection", serde_json::to_value(&probe)?)
            .await?)
    }

    // Shifts

    pub async fn list_shifts(&self) -> Result<Value, CommandError> {
        Ok(self.bridge.call("get_shifts", json!({})).await?)
    }

    pub async fn add_shift(&self, shift: ShiftDraft) -> Result<Value, CommandError> {
        validate_shift(&shift)?;
        Ok(self
            .bridge
            .call("add_shift", serde_json::to_value(&shift)?)
            .await?)
    }

    pub async fn update_shift(&self, update: ShiftUpdate) -> Result<Value, CommandError> {
        validate_shift(&update.shift)?;
        Ok(self
            .bridge
            .call("update_shift", serde_json::to_value(&update)?)
            .await?)
    }

    pub async fn delete_shift(&self, id: i64) -> Result<Value, CommandError> {
        Ok(self.bridge.call("delete_shift", json!({ "id": id })).await?)
    }

    // Sync

    pub async fn sync_status(&self) -> Result<Value, CommandError> {
        Ok(self.bridge.call("get_sync_status", json!({})).await?)
    }

    pub async fn sync_history(&self, query: HistoryQuery) -> Result<Value, CommandError> {
        validate_pagination(query.page, query.limit)?;
        Ok(self
            .bridge
            .call("get_sync_history", serde_json::to_value(&query)?)
            .await?)
    }

    pub async fn attendance_logs(&self, query: LogQuery) -> Result<Value, CommandError> {
        validate_pagination(query.page, query.limit)?;
        if let Some(date) = &query.date_from {
            validate_date("dateFrom", date)?;
        }
        if let Some(date) = &query.date_to {
            validate_date("dateTo", date)?;
        }
        Ok(self
            .bridge
            .call("get_attendance_logs", serde_json::to_value(&query)?)
            .await?)
    }

    /// Run one sync pass now, through the scheduler so the usual
    /// started/completed events fire. Does not disturb the timer.
    pub async fn trigger_sync(&self) -> Result<Value, CommandError> {
        Ok(self.scheduler.trigger_once().await?)
    }

    // ERPNext

    pub async fn test_erpnext_connection(&self, probe: ErpnextProbe) -> Result<Value, CommandError> {
        validate_erpnext_probe(&probe)?;
        Ok(self
            .bridge
            .call("test_erpnext_connection", serde_json::to_value(&probe)?)
            .await?)
    }

    // Exports

    pub async fn export_excel(&self, request: ExportRequest) -> Result<Value, CommandError> {
        validate_export(&request)?;
        Ok(self
            .bridge
            .call("export_to_excel", serde_json::to_value(&request)?)
            .await?)
    }

    pub async fn export_pdf(&self, request: ExportRequest) -> Result<Value, CommandError> {
        validate_export(&request)?;
        Ok(self
            .bridge
            .call("export_to_pdf", serde_json::to_value(&request)?)
            .await?)
    }

    // Configuration (host-side store, never proxied to the worker)

    pub fn config_get(&self, key: &str) -> Result<Option<Value>, CommandError> {
        Ok(self.store.get(key)?)
    }

    pub fn config_set(&self, key: &str, value: Value) -> Result<(), CommandError> {
        if key.trim().is_empty() {
            return Err(invalid("key", "must not be empty"));
        }
        Ok(self.store.set(key, value)?)
    }

    pub fn config_all(&self) -> Result<Map<String, Value>, CommandError> {
        Ok(self.store.all()?)
    }
}

fn validate_device(device: &DeviceDraft) -> Result<(), CommandError> {
    if device.name.trim().is_empty() {
        return Err(invalid("name", "must not be empty"));
    }
    validate_address(&device.ip)?;
    validate_port(device.port)?;
    if let Some(latitude) = device.latitude {
        if !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid("latitude", "must be between -90 and 90"));
        }
    }
    if let Some(longitude) = device.longitude {
        if !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid("longitude", "must be between -180 and 180"));
        }
    }
    Ok(())
}

fn validate_address(address: &str) -> Result<(), CommandError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(invalid("ip", "must not be empty"));
    }
    if address.parse::<std::net::IpAddr>().is_ok() || is_valid_hostname(address) {
        return Ok(());
    }
    Err(invalid(
        "ip",
        format!("'{address}' is not an IP address or hostname"),
    ))
}

fn is_valid_hostname(host: &str) -> bool {
    if host.len() > 253 {
        return false;
    }
    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}

fn validate_port(port: u16) -> Result<(), CommandError> {
    if port == 0 {
        return Err(invalid("port", "must be between 1 and 65535"));
    }
    Ok(())
}

fn validate_shift(shift: &ShiftDraft) -> Result<(), CommandError> {
    if shift.name.trim().is_empty() {
        return Err(invalid("name", "must not be empty"));
    }
    validate_time("start_time", &shift.start_time)?;
    validate_time("end_time", &shift.end_time)?;
    Ok(())
}

fn validate_time(field: &'static str, value: &str) -> Result<(), CommandError> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .map(|_| ())
        .map_err(|_| invalid(field, format!("'{value}' is not a HH:MM time")))
}

fn validate_date(field: &'static str, value: &str) -> Result<(), CommandError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map(|_| ())
        .map_err(|_| invalid(field, format!("'{value}' is not a YYYY-MM-DD date")))
}

fn validate_pagination(page: u64, limit: u64) -> Result<(), CommandError> {
    if page == 0 {
        return Err(invalid("page", "must be at least 1"));
    }
    if !(1..=500).contains(&limit) {
        return Err(invalid("limit", "must be between 1 and 500"));
    }
    Ok(())
}

fn validate_erpnext_probe(probe: &ErpnextProbe) -> Result<(), CommandError> {
    let url = probe.url.trim();
    let host = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or("");
    if host.is_empty() {
        return Err(invalid("url", "must be an http(s) URL"));
    }
    if probe.api_key.trim().is_empty() {
        return Err(invalid("apiKey", "must not be empty"));
    }
    if probe.api_secret.trim().is_empty() {
        return Err(invalid("apiSecret", "must not be empty"));
    }
    if probe.version < 12 {
        return Err(invalid("version", "must be 12 or newer"));
    }
    Ok(())
}

fn validate_export(request: &ExportRequest) -> Result<(), CommandError> {
    if let Some(date) = &request.date_from {
        validate_date("dateFrom", date)?;
    }
    if let Some(date) = &request.date_to {
        validate_date("dateTo", date)?;
    }
    Ok(())
}
