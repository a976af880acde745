//! Host configuration, loaded from `config.toml`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BridgeError, Result};

/// Top-level host configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub bridge: BridgeConfig,
    pub visibility: VisibilityConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

/// Transport channel sizing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Inbound commands buffered before the reader applies backpressure.
    pub request_capacity: usize,
    /// Outbound responses buffered for the writer.
    pub response_capacity: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_capacity: 64,
            response_capacity: 256,
        }
    }
}

/// Bounded wait used when a command needs a visible UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilityConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for VisibilityConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3_000,
            poll_interval_ms: 100,
        }
    }
}

impl VisibilityConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Poll interval, never zero so a wait always makes progress.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Where secrets are kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecretBackend {
    /// OS credential store.
    #[default]
    Keyring,
    /// Process memory only; lost on exit.
    Memory,
}

/// Persistence backends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Settings file. Defaults to `settings.toml` in the data directory.
    pub settings_path: Option<PathBuf>,
    /// Service name secrets are filed under in the OS credential store.
    pub secret_service: String,
    pub secret_backend: SecretBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            settings_path: None,
            secret_service: "tether".to_owned(),
            secret_backend: SecretBackend::default(),
        }
    }
}

impl StorageConfig {
    #[must_use]
    pub fn resolved_settings_path(&self) -> PathBuf {
        self.settings_path
            .clone()
            .unwrap_or_else(crate::dirs::settings_file)
    }
}

/// Log output. Stdout is reserved for the protocol, so logs go to stderr
/// and optionally to a daily file under the logs directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub file: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "tether=info".to_owned(),
            file: false,
        }
    }
}

impl HostConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| BridgeError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise defaults.
    ///
    /// # Errors
    ///
    /// Returns an error only if an existing file cannot be parsed.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written or the config cannot be serialized.
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content =
            toml::to_string_pretty(self).map_err(|e| BridgeError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// `config.toml` in the config directory.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        crate::dirs::config_dir().join("config.toml")
    }
}
