//! Configuration contract.
//!
//! The desktop shell owns an encrypted settings store; this core only
//! needs a key/value read/write surface over JSON values. Readers take
//! copy-out snapshots ([`SyncSettings`]); writers replace whole values,
//! never mutate in place.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use serde_json::{Map, Value};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access config store: {0}")]
    Io(#[from] std::io::Error),

    #[error("config store holds invalid data: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Key/value contract over the external settings store.
pub trait ConfigStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Value>, ConfigError>;
    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError>;
    fn all(&self) -> Result<Map<String, Value>, ConfigError>;
}

/// In-memory store for tests and for hosts that persist elsewhere.
#[derive(Default)]
pub struct MemoryConfigStore {
    entries: StdMutex<Map<String, Value>>,
}

impl MemoryConfigStore {
    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn get(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        self.lock().insert(key.to_string(), value);
        Ok(())
    }

    fn all(&self) -> Result<Map<String, Value>, ConfigError> {
        Ok(self.lock().clone())
    }
}

/// Write-through JSON file store.
///
/// Writes go to a sibling temp file first and land via rename, so a crash
/// mid-write cannot truncate existing settings.
pub struct JsonFileConfigStore {
    path: PathBuf,
    entries: StdMutex<Map<String, Value>>,
}

impl JsonFileConfigStore {
    /// Open the store, loading existing entries. A missing file is an
    /// empty store.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            entries: StdMutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Map<String, Value>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, entries: &Map<String, Value>) -> Result<(), ConfigError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl ConfigStore for JsonFileConfigStore {
    fn get(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        let mut entries = self.lock();
        entries.insert(key.to_string(), value);
        self.persist(&entries)
    }

    fn all(&self) -> Result<Map<String, Value>, ConfigError> {
        Ok(self.lock().clone())
    }
}

pub mod keys {
    pub const ERPNEXT_URL: &str = "erpnext_url";
    pub const API_KEY: &str = "api_key";
    pub const API_SECRET: &str = "api_secret";
    pub const ERPNEXT_VERSION: &str = "erpnext_version";
    pub const SYNC_INTERVAL_MINUTES: &str = "sync_interval_minutes";
    pub const AUTO_START: &str = "auto_start";
}

/// Copy-out snapshot of the settings this core consumes.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    pub erpnext_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub erpnext_version: u32,
    pub sync_interval_minutes: u64,
    pub auto_start: bool,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            erpnext_url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            erpnext_version: 15,
            sync_interval_minutes: 5,
            auto_start: false,
        }
    }
}

impl SyncSettings {
    /// Load a snapshot; absent or malformed keys fall back to defaults.
    pub fn load(store: &dyn ConfigStore) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            erpnext_url: get_string(store, keys::ERPNEXT_URL)?.unwrap_or(defaults.erpnext_url),
            api_key: get_string(store, keys::API_KEY)?.unwrap_or(defaults.api_key),
            api_secret: get_string(store, keys::API_SECRET)?.unwrap_or(defaults.api_secret),
            erpnext_version: get_u64(store, keys::ERPNEXT_VERSION)?
                .map(|v| v as u32)
                .unwrap_or(defaults.erpnext_version),
            sync_interval_minutes: get_u64(store, keys::SYNC_INTERVAL_MINUTES)?
                .filter(|minutes| *minutes > 0)
                .unwrap_or(defaults.sync_interval_minutes),
            auto_start: get_bool(store, keys::AUTO_START)?.unwrap_or(defaults.auto_start),
        })
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes * 60)
    }
}

fn get_string(store: &dyn ConfigStore, key: &str) -> Result<Option<String>, ConfigError> {
    Ok(store
        .get(key)?
        .and_then(|value| value.as_str().map(str::to_string)))
}

fn get_u64(store: &dyn ConfigStore, key: &str) -> Result<Option<u64>, ConfigError> {
    Ok(store.get(key)?.and_then(|value| value.as_u64()))
}

fn get_bool(store: &dyn ConfigStore, key: &str) -> Result<Option<bool>, ConfigError> {
    Ok(store.get(key)?.and_then(|value| value.as_bool()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_fall_back_to_defaults() {
        let store = MemoryConfigStore::default();
        let settings = SyncSettings::load(&store).unwrap();
        assert_eq!(settings, SyncSettings::default());
        assert_eq!(settings.sync_interval_minutes, 5);
        assert_eq!(settings.erpnext_version, 15);
        assert!(!settings.auto_start);
    }

    #[test]
    fn settings_read_configured_values() {
        let store = MemoryConfigStore::default();
        store
            .set(keys::ERPNEXT_URL, json!("https://hr.example.com"))
            .unwrap();
        store.set(keys::SYNC_INTERVAL_MINUTES, json!(15)).unwrap();
        store.set(keys::AUTO_START, json!(true)).unwrap();

        let settings = SyncSettings::load(&store).unwrap();
        assert_eq!(settings.erpnext_url, "https://hr.example.com");
        assert_eq!(settings.interval(), Duration::from_secs(15 * 60));
        assert!(settings.auto_start);
    }

    #[test]
    fn zero_interval_falls_back_to_default() {
        let store = MemoryConfigStore::default();
        store.set(keys::SYNC_INTERVAL_MINUTES, json!(0)).unwrap();
        let settings = SyncSettings::load(&store).unwrap();
        assert_eq!(settings.sync_interval_minutes, 5);
    }

    #[test]
    fn snapshot_is_copy_out() {
        let store = MemoryConfigStore::default();
        store.set(keys::SYNC_INTERVAL_MINUTES, json!(10)).unwrap();
        let snapshot = SyncSettings::load(&store).unwrap();

        store.set(keys::SYNC_INTERVAL_MINUTES, json!(1)).unwrap();
        assert_eq!(snapshot.sync_interval_minutes, 10);
    }

    #[test]
    fn file_store_round_trips_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");

        {
            let store = JsonFileConfigStore::open(&path).unwrap();
            store.set(keys::API_KEY, json!("abc123")).unwrap();
            store.set(keys::AUTO_START, json!(true)).unwrap();
        }

        let store = JsonFileConfigStore::open(&path).unwrap();
        assert_eq!(store.get(keys::API_KEY).unwrap(), Some(json!("abc123")));
        assert_eq!(store.get(keys::AUTO_START).unwrap(), Some(json!(true)));
        assert_eq!(store.all().unwrap().len(), 2);
    }

    #[test]
    fn missing_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileConfigStore::open(dir.path().join("nope.json")).unwrap();
        assert_eq!(store.get("anything").unwrap(), None);
        assert!(store.all().unwrap().is_empty());
    }
}
