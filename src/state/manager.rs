//! Cached, layered configuration state.
//!
//! The manager owns three in-memory caches (secrets, global settings, the
//! active task's overrides) and is the only component that touches the
//! persistence backends. Writes land in the cache synchronously and are
//! persisted in order by a background worker; the cache stays authoritative
//! for the rest of the session even if persistence fails.
//!
//! Persistence ops are queued while the cache write guard is still held, so
//! the worker sees writes in the same order as the cache.

use crate::error::{BridgeError, Result};
use crate::provider::ProviderKind;
use crate::state::keys::{ConfigField, MODE_KEY, Mode, SecretKey};
use crate::state::resolve::resolve;
use crate::state::store::{SecretStore, SettingsStore};
use crate::state::versioned::{
    AutoApprovalSettings, VersionedSetting, VersionedUpdate, check_version, is_versioned_key,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Capacity of the state-change broadcast channel.
const CHANGE_CAPACITY: usize = 64;

/// Flattened API configuration, resolved per call.
#[derive(Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiConfiguration {
    pub mode: Mode,
    pub provider: Option<ProviderKind>,
    pub model_id: Option<String>,
    pub base_url: Option<String>,
    pub thinking_budget_tokens: Option<u64>,
    pub reasoning_effort: Option<String>,
    pub temperature: Option<f64>,
    pub request_timeout_ms: Option<u64>,
    /// Secret for the resolved provider. Never serialized.
    #[serde(skip)]
    pub api_key: Option<String>,
}

impl std::fmt::Debug for ApiConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfiguration")
            .field("mode", &self.mode)
            .field("provider", &self.provider)
            .field("model_id", &self.model_id)
            .field("base_url", &self.base_url)
            .field("thinking_budget_tokens", &self.thinking_budget_tokens)
            .field("reasoning_effort", &self.reasoning_effort)
            .field("temperature", &self.temperature)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Notification emitted after a change has been applied to the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum StateChange {
    Settings { keys: Vec<String> },
    SettingsReset,
    Secrets { keys: Vec<SecretKey> },
    Mode(Mode),
    Task { task_id: Option<String> },
    Versioned { key: &'static str, version: u64 },
}

/// The unit of work currently bound to the manager.
///
/// Receives versioned settings synchronously as soon as they are applied,
/// in version order. Implementations must not write versioned settings from
/// inside the callback.
pub trait TaskBinding: Send + Sync {
    fn on_versioned_setting(&self, key: &str, value: &Value);
}

struct TaskScope {
    task_id: String,
    overrides: HashMap<String, Value>,
    binding: Option<Arc<dyn TaskBinding>>,
}

enum PersistOp {
    SetSecrets(Vec<(SecretKey, String)>),
    DeleteSecrets(Vec<SecretKey>),
    SetSettings(HashMap<String, Value>),
    RemoveSettings(Vec<String>),
    ClearSettings,
    Flush(oneshot::Sender<()>),
}

/// Single logical configuration surface over a secret store and a settings
/// store.
pub struct StateManager {
    secrets: RwLock<HashMap<SecretKey, String>>,
    global: RwLock<HashMap<String, Value>>,
    task: RwLock<Option<TaskScope>>,
    /// Serializes versioned writes through to the task callback.
    versioned_writes: Mutex<()>,
    persist_tx: mpsc::UnboundedSender<PersistOp>,
    change_tx: broadcast::Sender<StateChange>,
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("settings", &read(&self.global).len())
            .field("secrets", &read(&self.secrets).len())
            .field("task", &self.active_task_id())
            .finish()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl StateManager {
    /// Rehydrate caches from both stores and start the persistence worker.
    ///
    /// Read failures never abort startup: an unreadable secret is skipped and
    /// an unreadable settings store yields an empty settings cache.
    pub async fn initialize(
        secret_store: Arc<dyn SecretStore>,
        settings_store: Arc<dyn SettingsStore>,
    ) -> Arc<Self> {
        let (secrets, global) = {
            let secret_store = Arc::clone(&secret_store);
            let settings_store = Arc::clone(&settings_store);
            tokio::task::spawn_blocking(move || {
                (
                    load_secrets(secret_store.as_ref()),
                    load_settings(settings_store.as_ref()),
                )
            })
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "state rehydration task failed; starting empty");
                (HashMap::new(), HashMap::new())
            })
        };

        info!(
            settings = global.len(),
            secrets = secrets.len(),
            "state manager initialized"
        );

        let (persist_tx, persist_rx) = mpsc::unbounded_channel();
        tokio::spawn(persistence_worker(persist_rx, secret_store, settings_store));

        let (change_tx, _) = broadcast::channel(CHANGE_CAPACITY);
        Arc::new(Self {
            secrets: RwLock::new(secrets),
            global: RwLock::new(global),
            task: RwLock::new(None),
            versioned_writes: Mutex::new(()),
            persist_tx,
            change_tx,
        })
    }

    /// Receive a notification for every applied change.
    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<StateChange> {
        self.change_tx.subscribe()
    }

    fn notify(&self, change: StateChange) {
        let _ = self.change_tx.send(change);
    }

    fn persist(&self, op: PersistOp) {
        if self.persist_tx.send(op).is_err() {
            warn!("persistence worker is gone; change kept in memory only");
        }
    }

    /// Wait until every write queued so far has reached the stores.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.persist(PersistOp::Flush(tx));
        let _ = rx.await;
    }

    // ── secrets ──

    #[must_use]
    pub fn get_secret(&self, key: SecretKey) -> Option<String> {
        read(&self.secrets).get(&key).cloned()
    }

    pub fn set_secret(&self, key: SecretKey, value: impl Into<String>) {
        self.set_secrets_batch(HashMap::from([(key, value.into())]));
    }

    /// Write several secrets at once: cache now, store in the background.
    pub fn set_secrets_batch(&self, secrets: HashMap<SecretKey, String>) {
        if secrets.is_empty() {
            return;
        }
        let keys: Vec<SecretKey> = secrets.keys().copied().collect();
        {
            let mut cache = write(&self.secrets);
            for (key, value) in &secrets {
                cache.insert(*key, value.clone());
            }
            self.persist(PersistOp::SetSecrets(secrets.into_iter().collect()));
        }
        self.notify(StateChange::Secrets { keys });
    }

    pub fn delete_secret(&self, key: SecretKey) {
        {
            let mut cache = write(&self.secrets);
            cache.remove(&key);
            self.persist(PersistOp::DeleteSecrets(vec![key]));
        }
        self.notify(StateChange::Secrets { keys: vec![key] });
    }

    /// Names of secrets that currently have a value.
    #[must_use]
    pub fn configured_secrets(&self) -> Vec<SecretKey> {
        let cache = read(&self.secrets);
        SecretKey::ALL
            .into_iter()
            .filter(|key| cache.contains_key(key))
            .collect()
    }

    // ── global settings ──

    #[must_use]
    pub fn get_global_setting(&self, key: &str) -> Option<Value> {
        read(&self.global).get(key).cloned()
    }

    /// Typed read; a value that fails to deserialize reads as `None`.
    #[must_use]
    pub fn get_global_setting_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_global_setting(key)
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Every plaintext setting. Never contains secrets.
    #[must_use]
    pub fn get_all_global_settings(&self) -> HashMap<String, Value> {
        read(&self.global).clone()
    }

    pub fn set_global_setting(&self, key: impl Into<String>, value: Value) -> Result<()> {
        self.set_global_state_batch(HashMap::from([(key.into(), value)]))
    }

    /// Write several settings at once. A `null` value removes the key.
    ///
    /// The whole batch is rejected if any key names a secret or a versioned
    /// setting, or if a value holds `null` inside an array (the settings file
    /// cannot store it).
    pub fn set_global_state_batch(&self, entries: HashMap<String, Value>) -> Result<()> {
        for (key, value) in &entries {
            if SecretKey::parse(key).is_some() {
                return Err(BridgeError::Config(format!(
                    "`{key}` is a secret; use the secrets path"
                )));
            }
            if is_versioned_key(key) {
                return Err(BridgeError::Config(format!(
                    "`{key}` is versioned; use its versioned update"
                )));
            }
            if has_null_array_element(value) {
                return Err(BridgeError::Config(format!(
                    "`{key}` holds null inside an array"
                )));
            }
        }
        if entries.is_empty() {
            return Ok(());
        }
        let keys: Vec<String> = entries.keys().cloned().collect();
        self.apply_settings(entries);
        self.notify(StateChange::Settings { keys });
        Ok(())
    }

    fn apply_settings(&self, entries: HashMap<String, Value>) {
        let (removed, set): (Vec<_>, Vec<_>) =
            entries.into_iter().partition(|(_, value)| value.is_null());
        let removed: Vec<String> = removed.into_iter().map(|(key, _)| key).collect();
        let set: HashMap<String, Value> = set.into_iter().collect();
        {
            let mut cache = write(&self.global);
            for key in &removed {
                cache.remove(key);
            }
            for (key, value) in &set {
                cache.insert(key.clone(), value.clone());
            }
            if !removed.is_empty() {
                self.persist(PersistOp::RemoveSettings(removed));
            }
            if !set.is_empty() {
                self.persist(PersistOp::SetSettings(set));
            }
        }
    }

    /// Delete every plaintext setting. Secrets are untouched.
    pub fn reset_global_settings(&self) {
        {
            let mut cache = write(&self.global);
            cache.clear();
            self.persist(PersistOp::ClearSettings);
        }
        self.notify(StateChange::SettingsReset);
    }

    // ── mode ──

    #[must_use]
    pub fn mode(&self) -> Mode {
        self.get_global_setting_as(MODE_KEY).unwrap_or_default()
    }

    pub fn set_mode(&self, mode: Mode) {
        self.apply_settings(HashMap::from([(
            MODE_KEY.to_owned(),
            Value::String(mode.as_str().to_owned()),
        )]));
        debug!(mode = mode.as_str(), "mode changed");
        self.notify(StateChange::Mode(mode));
    }

    // ── task scope ──

    /// Bind a task, replacing any previous one and its overrides.
    pub fn start_task(&self, task_id: impl Into<String>, binding: Option<Arc<dyn TaskBinding>>) {
        let task_id = task_id.into();
        *write(&self.task) = Some(TaskScope {
            task_id: task_id.clone(),
            overrides: HashMap::new(),
            binding,
        });
        self.notify(StateChange::Task {
            task_id: Some(task_id),
        });
    }

    /// Set (or with `null`, remove) an override on the active task.
    pub fn set_task_override(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        if SecretKey::parse(&key).is_some() {
            return Err(BridgeError::Config(format!(
                "`{key}` is a secret and cannot be overridden per task"
            )));
        }
        let task_id = {
            let mut task = write(&self.task);
            let Some(scope) = task.as_mut() else {
                return Err(BridgeError::Config(
                    "no active task to override settings on".to_owned(),
                ));
            };
            if value.is_null() {
                scope.overrides.remove(&key);
            } else {
                scope.overrides.insert(key, value);
            }
            scope.task_id.clone()
        };
        self.notify(StateChange::Task {
            task_id: Some(task_id),
        });
        Ok(())
    }

    /// Unbind the active task and drop its overrides.
    pub fn clear_task(&self) {
        let previous = write(&self.task).take();
        if previous.is_some() {
            self.notify(StateChange::Task { task_id: None });
        }
    }

    #[must_use]
    pub fn active_task_id(&self) -> Option<String> {
        read(&self.task).as_ref().map(|scope| scope.task_id.clone())
    }

    #[must_use]
    pub fn task_overrides(&self) -> HashMap<String, Value> {
        read(&self.task)
            .as_ref()
            .map(|scope| scope.overrides.clone())
            .unwrap_or_default()
    }

    // ── resolution ──

    /// Resolve every configuration field through task > mode > global.
    ///
    /// Recomputed on every call; nothing flattened is cached.
    #[must_use]
    pub fn get_api_configuration(&self) -> ApiConfiguration {
        let mode = self.mode();
        let mut config = {
            let global = read(&self.global);
            let task = read(&self.task);
            let overrides = task.as_ref().map(|scope| &scope.overrides);
            let layers = Layers {
                mode,
                overrides,
                global: &global,
            };
            ApiConfiguration {
                mode,
                provider: layers.field(ConfigField::ApiProvider),
                model_id: layers.field(ConfigField::ModelId),
                base_url: layers.field(ConfigField::BaseUrl),
                thinking_budget_tokens: layers.field(ConfigField::ThinkingBudgetTokens),
                reasoning_effort: layers.field(ConfigField::ReasoningEffort),
                temperature: layers.field(ConfigField::Temperature),
                request_timeout_ms: layers.field(ConfigField::RequestTimeoutMs),
                api_key: None,
            }
        };
        config.api_key = config
            .provider
            .and_then(ProviderKind::secret_key)
            .and_then(|key| self.get_secret(key));
        config
    }

    // ── versioned settings ──

    #[must_use]
    pub fn get_versioned_setting<S: VersionedSetting>(&self) -> Option<S> {
        self.get_global_setting_as(S::KEY)
    }

    #[must_use]
    pub fn auto_approval_settings(&self) -> AutoApprovalSettings {
        self.get_versioned_setting().unwrap_or_default()
    }

    /// Apply `incoming` only if its version is greater than the stored one.
    ///
    /// On apply the bound task (if any) receives the value before this
    /// returns, and a change notification is queued. A rejected write has no
    /// side effects.
    pub fn update_versioned_setting<S: VersionedSetting>(&self, incoming: S) -> Result<VersionedUpdate> {
        let value = serde_json::to_value(&incoming).map_err(|e| {
            BridgeError::Persistence(format!("failed to serialize {}: {e}", S::KEY))
        })?;

        let _serial = self
            .versioned_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let outcome = {
            let mut cache = write(&self.global);
            let current = cache
                .get(S::KEY)
                .and_then(|v| serde_json::from_value::<S>(v.clone()).ok())
                .map(|s| s.version());
            let outcome = check_version(current, incoming.version());
            if outcome.is_applied() {
                cache.insert(S::KEY.to_owned(), value.clone());
                self.persist(PersistOp::SetSettings(HashMap::from([(
                    S::KEY.to_owned(),
                    value.clone(),
                )])));
            }
            outcome
        };

        match outcome {
            VersionedUpdate::Applied { version } => {
                let binding = read(&self.task)
                    .as_ref()
                    .and_then(|scope| scope.binding.clone());
                if let Some(binding) = binding {
                    binding.on_versioned_setting(S::KEY, &value);
                }
                self.notify(StateChange::Versioned {
                    key: S::KEY,
                    version,
                });
            }
            VersionedUpdate::Rejected { current, incoming } => {
                debug!(key = S::KEY, current, incoming, "stale versioned write ignored");
            }
        }
        Ok(outcome)
    }

    // ── snapshot ──

    /// Full state as pushed to UI instances. Secret values are never included,
    /// only the names of secrets that are set.
    #[must_use]
    pub fn state_snapshot(&self) -> Value {
        let task = read(&self.task).as_ref().map(|scope| {
            serde_json::json!({
                "taskId": scope.task_id,
                "overrides": scope.overrides,
            })
        });
        serde_json::json!({
            "mode": self.mode(),
            "settings": self.get_all_global_settings(),
            "apiConfiguration": self.get_api_configuration(),
            "autoApprovalSettings": self.auto_approval_settings(),
            "secretsConfigured": self.configured_secrets(),
            "task": task,
        })
    }
}

fn has_null_array_element(value: &Value) -> bool {
    match value {
        Value::Array(items) => items
            .iter()
            .any(|item| item.is_null() || has_null_array_element(item)),
        Value::Object(map) => map.values().any(has_null_array_element),
        _ => false,
    }
}

struct Layers<'a> {
    mode: Mode,
    overrides: Option<&'a HashMap<String, Value>>,
    global: &'a HashMap<String, Value>,
}

impl Layers<'_> {
    fn field<T: DeserializeOwned>(&self, field: ConfigField) -> Option<T> {
        fn parse<T: DeserializeOwned>(value: Option<&Value>) -> Option<T> {
            value
                .filter(|value| !value.is_null())
                .and_then(|value| serde_json::from_value(value.clone()).ok())
        }
        resolve(
            parse(self.overrides.and_then(|o| o.get(field.global_key()))),
            parse(self.global.get(&field.mode_key(self.mode))),
            parse(self.global.get(field.global_key())),
        )
    }
}

fn load_secrets(store: &dyn SecretStore) -> HashMap<SecretKey, String> {
    let mut secrets = HashMap::new();
    for key in SecretKey::ALL {
        match store.get(key.as_str()) {
            Ok(Some(value)) => {
                secrets.insert(key, value);
            }
            Ok(None) => {}
            Err(e) => warn!(key = key.as_str(), error = %e, "failed to read secret; treating as unset"),
        }
    }
    secrets
}

fn load_settings(store: &dyn SettingsStore) -> HashMap<String, Value> {
    store.load_all().unwrap_or_else(|e| {
        warn!(error = %e, "failed to read settings; starting from defaults");
        HashMap::new()
    })
}

async fn persistence_worker(
    mut rx: mpsc::UnboundedReceiver<PersistOp>,
    secret_store: Arc<dyn SecretStore>,
    settings_store: Arc<dyn SettingsStore>,
) {
    while let Some(op) = rx.recv().await {
        if let PersistOp::Flush(done) = op {
            let _ = done.send(());
            continue;
        }
        let secret_store = Arc::clone(&secret_store);
        let settings_store = Arc::clone(&settings_store);
        let result = tokio::task::spawn_blocking(move || {
            apply_persist_op(op, secret_store.as_ref(), settings_store.as_ref());
        })
        .await;
        if let Err(e) = result {
            warn!(error = %e, "persistence task panicked; cache remains authoritative");
        }
    }
    debug!("persistence worker stopped");
}

fn apply_persist_op(op: PersistOp, secrets: &dyn SecretStore, settings: &dyn SettingsStore) {
    match op {
        PersistOp::SetSecrets(entries) => {
            for (key, value) in entries {
                if let Err(e) = secrets.set(key.as_str(), &value) {
                    warn!(key = key.as_str(), error = %e, "failed to persist secret");
                }
            }
        }
        PersistOp::DeleteSecrets(keys) => {
            for key in keys {
                if let Err(e) = secrets.delete(key.as_str()) {
                    warn!(key = key.as_str(), error = %e, "failed to delete secret");
                }
            }
        }
        PersistOp::SetSettings(entries) => {
            if let Err(e) = settings.set_many(&entries) {
                warn!(keys = entries.len(), error = %e, "failed to persist settings");
            }
        }
        PersistOp::RemoveSettings(keys) => {
            if let Err(e) = settings.remove_many(&keys) {
                warn!(keys = keys.len(), error = %e, "failed to remove settings");
            }
        }
        PersistOp::ClearSettings => {
            if let Err(e) = settings.clear() {
                warn!(error = %e, "failed to clear settings");
            }
        }
        PersistOp::Flush(done) => {
            let _ = done.send(());
        }
    }
}
