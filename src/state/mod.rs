//! Layered configuration state: secrets, global settings, task overrides.

pub mod keys;
pub mod manager;
pub mod resolve;
pub mod store;
pub mod versioned;

pub use keys::{ConfigField, MODE_KEY, Mode, SecretKey};
pub use manager::{ApiConfiguration, StateChange, StateManager, TaskBinding};
pub use store::{
    KeyringSecretStore, MemorySecretStore, MemorySettingsStore, SecretStore, SettingsStore,
    StoreError, TomlSettingsStore,
};
pub use versioned::{
    AutoApprovalActions, AutoApprovalSettings, VERSIONED_KEYS, VersionedSetting, VersionedUpdate,
    is_versioned_key,
};
