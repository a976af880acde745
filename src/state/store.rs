//! Persistence backends behind the state manager.
//!
//! Two physically distinct stores:
//!
//! - [`SecretStore`]: string values keyed by name, targeted get/set/delete
//!   only. Backed by the platform credential store via `keyring`.
//! - [`SettingsStore`]: structured values keyed by name, with a bulk load
//!   for startup rehydration. Backed by a TOML file written atomically.
//!
//! In-memory variants of both are provided for headless runs and tests.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Errors raised by persistence backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Secret storage keyed by name.
pub trait SecretStore: Send + Sync + 'static {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    /// Delete a secret. Deleting a missing secret is not an error.
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Plain settings storage keyed by name.
pub trait SettingsStore: Send + Sync + 'static {
    /// Load every stored setting.
    fn load_all(&self) -> Result<HashMap<String, Value>, StoreError>;
    /// Upsert the given entries.
    fn set_many(&self, entries: &HashMap<String, Value>) -> Result<(), StoreError>;
    /// Remove the given keys; missing keys are ignored.
    fn remove_many(&self, keys: &[String]) -> Result<(), StoreError>;
    /// Remove every setting.
    fn clear(&self) -> Result<(), StoreError>;
}

// ── keyring ──

/// Secret store on the platform credential service (Keychain, Secret
/// Service, Windows Credential Manager).
#[derive(Debug, Clone)]
pub struct KeyringSecretStore {
    service: String,
}

impl KeyringSecretStore {
    #[must_use]
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry, StoreError> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| StoreError::Backend(format!("failed to open keyring entry `{key}`: {e}")))
    }
}

impl SecretStore for KeyringSecretStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(StoreError::Backend(format!(
                "failed to read secret `{key}`: {e}"
            ))),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| StoreError::Backend(format!("failed to store secret `{key}`: {e}")))
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(StoreError::Backend(format!(
                "failed to delete secret `{key}`: {e}"
            ))),
        }
    }
}

// ── TOML file ──

/// Settings kept in a single TOML file.
///
/// Each write reads the file, applies the change, and replaces the file
/// atomically (temp file → fsync → rename). TOML has no `null`: null keys
/// are dropped on write, and so are null array elements, which shifts the
/// remaining elements. The state manager refuses array nulls before they
/// reach a store.
#[derive(Debug)]
pub struct TomlSettingsStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TomlSettingsStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_table(&self) -> Result<Map<String, Value>, StoreError> {
        if !self.path.exists() {
            return Ok(Map::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        toml::from_str(&text).map_err(|e| {
            StoreError::Serialize(format!(
                "failed to parse settings file '{}': {e}",
                self.path.display()
            ))
        })
    }

    fn write_table(&self, table: Map<String, Value>) -> Result<(), StoreError> {
        let table: Map<String, Value> = table
            .into_iter()
            .filter_map(|(key, value)| strip_nulls(value).map(|value| (key, value)))
            .collect();
        let text = toml::to_string_pretty(&table)
            .map_err(|e| StoreError::Serialize(format!("failed to serialize settings: {e}")))?;
        write_text_atomic(&self.path, &text)
    }

    fn modify(&self, f: impl FnOnce(&mut Map<String, Value>)) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut table = self.read_table()?;
        f(&mut table);
        self.write_table(table)
    }
}

impl SettingsStore for TomlSettingsStore {
    fn load_all(&self) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self.read_table()?.into_iter().collect())
    }

    fn set_many(&self, entries: &HashMap<String, Value>) -> Result<(), StoreError> {
        self.modify(|table| {
            for (key, value) in entries {
                table.insert(key.clone(), value.clone());
            }
        })
    }

    fn remove_many(&self, keys: &[String]) -> Result<(), StoreError> {
        self.modify(|table| {
            for key in keys {
                table.remove(key);
            }
        })
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.modify(Map::clear)
    }
}

fn strip_nulls(value: Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => Some(Value::Object(
            map.into_iter()
                .filter_map(|(k, v)| strip_nulls(v).map(|v| (k, v)))
                .collect(),
        )),
        Value::Array(items) => Some(Value::Array(
            items.into_iter().filter_map(strip_nulls).collect(),
        )),
        other => Some(other),
    }
}

/// Write `text` to `path` atomically (temp file → fsync → rename).
pub fn write_text_atomic(path: &Path, text: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    let mut file = std::fs::File::create(&tmp_path)?;
    file.write_all(text.as_bytes())?;
    file.sync_all()?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

// ── in-memory ──

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process secret store. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemorySecretStore {
    values: Arc<Mutex<HashMap<String, String>>>,
}

impl MemorySecretStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the stored secrets.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, String> {
        lock(&self.values).clone()
    }
}

impl SecretStore for MemorySecretStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(lock(&self.values).get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        lock(&self.values).insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        lock(&self.values).remove(key);
        Ok(())
    }
}

/// In-process settings store. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemorySettingsStore {
    values: Arc<Mutex<HashMap<String, Value>>>,
}

impl MemorySettingsStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_values(values: HashMap<String, Value>) -> Self {
        Self {
            values: Arc::new(Mutex::new(values)),
        }
    }

    /// Copy of the stored settings.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, Value> {
        lock(&self.values).clone()
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load_all(&self) -> Result<HashMap<String, Value>, StoreError> {
        Ok(self.snapshot())
    }

    fn set_many(&self, entries: &HashMap<String, Value>) -> Result<(), StoreError> {
        lock(&self.values).extend(entries.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn remove_many(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut values = lock(&self.values);
        for key in keys {
            values.remove(key);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        lock(&self.values).clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn toml_store_round_trips_structured_values() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlSettingsStore::new(dir.path().join("settings.toml"));
        assert!(store.load_all().unwrap().is_empty());

        let entries: HashMap<String, Value> = [
            ("apiModelId".to_owned(), json!("model-z")),
            ("requestTimeoutMs".to_owned(), json!(30_000)),
            (
                "autoApprovalSettings".to_owned(),
                json!({"version": 2, "enabled": true, "actions": {"readFiles": true}}),
            ),
        ]
        .into_iter()
        .collect();
        store.set_many(&entries).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.get("apiModelId"), Some(&json!("model-z")));
        assert_eq!(loaded.get("requestTimeoutMs"), Some(&json!(30_000)));
        assert_eq!(loaded["autoApprovalSettings"]["version"], json!(2));
        assert!(!dir.path().join("settings.toml.tmp").exists());
    }

    #[test]
    fn toml_store_drops_nulls_and_removes_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlSettingsStore::new(dir.path().join("nested").join("settings.toml"));
        let entries: HashMap<String, Value> = [
            ("keep".to_owned(), json!({"a": 1, "b": null})),
            ("gone".to_owned(), Value::Null),
            ("drop".to_owned(), json!(true)),
        ]
        .into_iter()
        .collect();
        store.set_many(&entries).unwrap();
        store.remove_many(&["drop".to_owned()]).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded["keep"], json!({"a": 1}));

        store.clear().unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn toml_store_reports_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "not = [valid").unwrap();
        let store = TomlSettingsStore::new(path);
        assert!(matches!(store.load_all(), Err(StoreError::Serialize(_))));
    }

    #[test]
    fn memory_stores_share_state_across_clones() {
        let secrets = MemorySecretStore::new();
        let view = secrets.clone();
        secrets.set("openAiApiKey", "sk-1").unwrap();
        assert_eq!(view.get("openAiApiKey").unwrap(), Some("sk-1".to_owned()));
        secrets.delete("openAiApiKey").unwrap();
        secrets.delete("openAiApiKey").unwrap();
        assert!(view.snapshot().is_empty());

        let settings = MemorySettingsStore::new();
        let view = settings.clone();
        settings
            .set_many(&[("mode".to_owned(), json!("plan"))].into_iter().collect())
            .unwrap();
        assert_eq!(view.load_all().unwrap()["mode"], json!("plan"));
    }
}
