//! Settings guarded by a monotonic version number.
//!
//! Several UI surfaces can edit the same setting and their writes may arrive
//! out of order. An incoming write is applied only when its version is
//! strictly greater than the stored one, so concurrent writers converge on
//! the highest version regardless of arrival order.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A setting that carries its own version.
pub trait VersionedSetting: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Settings-store key the value lives under.
    const KEY: &'static str;

    fn version(&self) -> u64;
}

/// Store keys owned by a [`VersionedSetting`]. Plain settings writes may not
/// touch them.
pub const VERSIONED_KEYS: [&str; 1] = [AutoApprovalSettings::KEY];

#[must_use]
pub fn is_versioned_key(key: &str) -> bool {
    VERSIONED_KEYS.contains(&key)
}

/// Outcome of a versioned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionedUpdate {
    Applied { version: u64 },
    Rejected { current: u64, incoming: u64 },
}

impl VersionedUpdate {
    #[must_use]
    pub fn is_applied(self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Version stored after the write was considered.
    #[must_use]
    pub fn current_version(self) -> u64 {
        match self {
            Self::Applied { version } => version,
            Self::Rejected { current, .. } => current,
        }
    }
}

/// Decide whether `incoming` may replace `current` (absent = never written).
#[must_use]
pub fn check_version(current: Option<u64>, incoming: u64) -> VersionedUpdate {
    match current {
        Some(current) if incoming <= current => VersionedUpdate::Rejected { current, incoming },
        _ => VersionedUpdate::Applied { version: incoming },
    }
}

/// Which tool actions run without asking.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoApprovalActions {
    pub read_files: bool,
    pub edit_files: bool,
    pub execute_safe_commands: bool,
    pub execute_all_commands: bool,
    pub use_browser: bool,
    pub use_mcp: bool,
}

/// Auto-approval policy, editable from several surfaces at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AutoApprovalSettings {
    pub version: u64,
    pub enabled: bool,
    pub actions: AutoApprovalActions,
    pub max_requests: u32,
    pub enable_notifications: bool,
}

impl Default for AutoApprovalSettings {
    fn default() -> Self {
        Self {
            version: 1,
            enabled: false,
            actions: AutoApprovalActions {
                read_files: true,
                ..AutoApprovalActions::default()
            },
            max_requests: 20,
            enable_notifications: false,
        }
    }
}

impl VersionedSetting for AutoApprovalSettings {
    const KEY: &'static str = "autoApprovalSettings";

    fn version(&self) -> u64 {
        self.version
    }
}
