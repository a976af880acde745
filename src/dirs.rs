//! Filesystem locations used by the host.
//!
//! | Purpose | Linux | Override |
//! |---------|-------|----------|
//! | Config | `~/.config/tether/` | `TETHER_CONFIG_DIR` |
//! | Data (settings, logs) | `~/.local/share/tether/` | `TETHER_DATA_DIR` |

use std::path::PathBuf;

/// Directory holding `config.toml`.
#[must_use]
pub fn config_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TETHER_CONFIG_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::config_dir()
        .map(|d| d.join("tether"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tether-config"))
}

/// Directory for persistent state: the settings file and logs.
#[must_use]
pub fn data_dir() -> PathBuf {
    if let Some(override_dir) = std::env::var_os("TETHER_DATA_DIR") {
        return PathBuf::from(override_dir);
    }
    dirs::data_dir()
        .map(|d| d.join("tether"))
        .unwrap_or_else(|| PathBuf::from("/tmp/tether-data"))
}

#[must_use]
pub fn logs_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Default location of the persisted global settings.
#[must_use]
pub fn settings_file() -> PathBuf {
    data_dir().join("settings.toml")
}
