//! Setting and secret key names.
//!
//! Settings and secrets are disjoint namespaces: a name that parses as a
//! [`SecretKey`] is never accepted as a setting key.

use serde::{Deserialize, Serialize};

/// Global setting that holds the current [`Mode`].
pub const MODE_KEY: &str = "mode";

/// Operating context with its own default configuration values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Plan,
    #[default]
    Act,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Act => "act",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "plan" => Some(Self::Plan),
            "act" => Some(Self::Act),
            _ => None,
        }
    }

    fn key_prefix(self) -> &'static str {
        match self {
            Self::Plan => "planMode",
            Self::Act => "actMode",
        }
    }
}

/// Secret names. Always routed to the secret store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SecretKey {
    #[serde(rename = "anthropicApiKey")]
    AnthropicApiKey,
    #[serde(rename = "openAiApiKey")]
    OpenAiApiKey,
    #[serde(rename = "openRouterApiKey")]
    OpenRouterApiKey,
    #[serde(rename = "geminiApiKey")]
    GeminiApiKey,
    #[serde(rename = "accountToken")]
    AccountToken,
}

impl SecretKey {
    pub const ALL: [SecretKey; 5] = [
        SecretKey::AnthropicApiKey,
        SecretKey::OpenAiApiKey,
        SecretKey::OpenRouterApiKey,
        SecretKey::GeminiApiKey,
        SecretKey::AccountToken,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AnthropicApiKey => "anthropicApiKey",
            Self::OpenAiApiKey => "openAiApiKey",
            Self::OpenRouterApiKey => "openRouterApiKey",
            Self::GeminiApiKey => "geminiApiKey",
            Self::AccountToken => "accountToken",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == raw)
    }
}

/// API configuration fields that resolve through task > mode > global.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigField {
    ApiProvider,
    ModelId,
    BaseUrl,
    ThinkingBudgetTokens,
    ReasoningEffort,
    Temperature,
    RequestTimeoutMs,
}

impl ConfigField {
    pub const ALL: [ConfigField; 7] = [
        ConfigField::ApiProvider,
        ConfigField::ModelId,
        ConfigField::BaseUrl,
        ConfigField::ThinkingBudgetTokens,
        ConfigField::ReasoningEffort,
        ConfigField::Temperature,
        ConfigField::RequestTimeoutMs,
    ];

    /// Key for the mode-independent value; task overrides use the same name.
    #[must_use]
    pub fn global_key(self) -> &'static str {
        match self {
            Self::ApiProvider => "apiProvider",
            Self::ModelId => "apiModelId",
            Self::BaseUrl => "apiBaseUrl",
            Self::ThinkingBudgetTokens => "thinkingBudgetTokens",
            Self::ReasoningEffort => "reasoningEffort",
            Self::Temperature => "temperature",
            Self::RequestTimeoutMs => "requestTimeoutMs",
        }
    }

    /// Key for the value scoped to `mode`, e.g. `planModeApiModelId`.
    #[must_use]
    pub fn mode_key(self, mode: Mode) -> String {
        let base = self.global_key();
        let mut chars = base.chars();
        let capitalized: String = match chars.next() {
            Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
            None => String::new(),
        };
        format!("{}{capitalized}", mode.key_prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_keys_are_prefixed_camel_case() {
        assert_eq!(ConfigField::ModelId.mode_key(Mode::Plan), "planModeApiModelId");
        assert_eq!(ConfigField::ApiProvider.mode_key(Mode::Act), "actModeApiProvider");
        assert_eq!(
            ConfigField::ThinkingBudgetTokens.mode_key(Mode::Plan),
            "planModeThinkingBudgetTokens"
        );
    }

    #[test]
    fn secret_names_never_collide_with_setting_names() {
        for field in ConfigField::ALL {
            assert!(SecretKey::parse(field.global_key()).is_none());
            for mode in [Mode::Plan, Mode::Act] {
                assert!(SecretKey::parse(&field.mode_key(mode)).is_none());
            }
        }
        assert!(SecretKey::parse(MODE_KEY).is_none());
    }

    #[test]
    fn secret_key_wire_names_round_trip() {
        for key in SecretKey::ALL {
            assert_eq!(SecretKey::parse(key.as_str()), Some(key));
            let json = serde_json::to_string(&key).unwrap_or_default();
            assert_eq!(json, format!("\"{}\"", key.as_str()));
        }
    }

    #[test]
    fn mode_parse_is_case_insensitive() {
        assert_eq!(Mode::parse(" PLAN "), Some(Mode::Plan));
        assert_eq!(Mode::parse("act"), Some(Mode::Act));
        assert_eq!(Mode::parse("debug"), None);
        assert_eq!(Mode::default(), Mode::Act);
    }
}
