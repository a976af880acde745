//! Versioned command/response/event envelopes exchanged with UI instances.

use serde::{Deserialize, Serialize};

/// Contract version for all envelopes.
pub const CONTRACT_VERSION: u32 = 1;

/// Command set accepted from UI instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "host.ping")]
    HostPing,
    #[serde(rename = "state.get")]
    StateGet,
    #[serde(rename = "state.subscribe")]
    StateSubscribe,
    #[serde(rename = "settings.update")]
    SettingsUpdate,
    #[serde(rename = "settings.reset")]
    SettingsReset,
    #[serde(rename = "secrets.set")]
    SecretsSet,
    #[serde(rename = "secrets.delete")]
    SecretsDelete,
    #[serde(rename = "mode.set")]
    ModeSet,
    #[serde(rename = "task.start")]
    TaskStart,
    #[serde(rename = "task.set_override")]
    TaskSetOverride,
    #[serde(rename = "task.clear")]
    TaskClear,
    #[serde(rename = "auto_approval.update")]
    AutoApprovalUpdate,
    #[serde(rename = "ui.subscribe")]
    UiSubscribe,
    #[serde(rename = "ui.focus_chat_input")]
    UiFocusChatInput,
    #[serde(rename = "ui.trigger_file_picker")]
    UiTriggerFilePicker,
    #[serde(rename = "provider.stream")]
    ProviderStream,
    #[serde(rename = "request.cancel")]
    RequestCancel,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HostPing => "host.ping",
            Self::StateGet => "state.get",
            Self::StateSubscribe => "state.subscribe",
            Self::SettingsUpdate => "settings.update",
            Self::SettingsReset => "settings.reset",
            Self::SecretsSet => "secrets.set",
            Self::SecretsDelete => "secrets.delete",
            Self::ModeSet => "mode.set",
            Self::TaskStart => "task.start",
            Self::TaskSetOverride => "task.set_override",
            Self::TaskClear => "task.clear",
            Self::AutoApprovalUpdate => "auto_approval.update",
            Self::UiSubscribe => "ui.subscribe",
            Self::UiFocusChatInput => "ui.focus_chat_input",
            Self::UiTriggerFilePicker => "ui.trigger_file_picker",
            Self::ProviderStream => "provider.stream",
            Self::RequestCancel => "request.cancel",
        }
    }

    /// Parse a command name from wire format.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "host.ping" => Some(Self::HostPing),
            "state.get" => Some(Self::StateGet),
            "state.subscribe" => Some(Self::StateSubscribe),
            "settings.update" => Some(Self::SettingsUpdate),
            "settings.reset" => Some(Self::SettingsReset),
            "secrets.set" => Some(Self::SecretsSet),
            "secrets.delete" => Some(Self::SecretsDelete),
            "mode.set" => Some(Self::ModeSet),
            "task.start" => Some(Self::TaskStart),
            "task.set_override" => Some(Self::TaskSetOverride),
            "task.clear" => Some(Self::TaskClear),
            "auto_approval.update" => Some(Self::AutoApprovalUpdate),
            "ui.subscribe" => Some(Self::UiSubscribe),
            "ui.focus_chat_input" => Some(Self::UiFocusChatInput),
            "ui.trigger_file_picker" => Some(Self::UiTriggerFilePicker),
            "provider.stream" => Some(Self::ProviderStream),
            "request.cancel" => Some(Self::RequestCancel),
            _ => None,
        }
    }

    /// Whether the command answers with a stream rather than a single message.
    #[must_use]
    pub fn is_streaming(self) -> bool {
        matches!(
            self,
            Self::StateSubscribe | Self::UiSubscribe | Self::ProviderStream
        )
    }
}

/// Push-only event topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// The host asks the UI to open its file picker.
    FilePicker,
    /// The host asks the UI to focus the chat input.
    FocusChatInput,
    /// Full state snapshots after any applied change.
    State,
}

impl Topic {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FilePicker => "file_picker",
            Self::FocusChatInput => "focus_chat_input",
            Self::State => "state",
        }
    }

    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "file_picker" => Some(Self::FilePicker),
            "focus_chat_input" => Some(Self::FocusChatInput),
            "state" => Some(Self::State),
            _ => None,
        }
    }
}

/// A versioned command envelope from UI -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Build a v1 command envelope.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: CONTRACT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Decode one wire line.
    ///
    /// The request id is read before anything else, so a line that names an
    /// unknown command or has a malformed field can still be answered on the
    /// caller's id. Only lines without a usable id fail without one.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        let value: serde_json::Value = serde_json::from_slice(raw).map_err(|e| DecodeError {
            request_id: None,
            message: format!("failed to parse command envelope: {e}"),
        })?;
        let request_id = value
            .get("request_id")
            .and_then(serde_json::Value::as_str)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_owned);
        let Some(request_id) = request_id else {
            return Err(DecodeError {
                request_id: None,
                message: "command envelope has no request_id".to_owned(),
            });
        };
        let fail = |message: String| DecodeError {
            request_id: Some(request_id.clone()),
            message,
        };

        let Some(raw_command) = value.get("command").and_then(serde_json::Value::as_str) else {
            return Err(fail("command envelope has no command name".to_owned()));
        };
        let Some(command) = CommandName::parse(raw_command) else {
            return Err(fail(format!("unknown command `{raw_command}`")));
        };
        let Some(v) = value
            .get("v")
            .and_then(serde_json::Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
        else {
            return Err(fail("command envelope has no valid contract version".to_owned()));
        };

        Ok(Self {
            v,
            command,
            payload: value
                .get("payload")
                .cloned()
                .unwrap_or(serde_json::Value::Null),
            request_id,
        })
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != CONTRACT_VERSION {
            return Err(ContractError::new(
                ContractErrorKind::UnsupportedVersion,
                format!(
                    "unsupported contract version {}; expected {}",
                    self.v, CONTRACT_VERSION
                ),
            ));
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::new(
                ContractErrorKind::InvalidEnvelope,
                "request_id cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A line that could not be decoded into a [`CommandEnvelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// Caller's request id, when the line carried one.
    pub request_id: Option<String>,
    pub message: String,
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for DecodeError {}

/// A versioned response message from host -> UI.
///
/// A unary call yields exactly one message with `is_last = true`. A
/// streaming call yields zero or more `is_last = false` messages followed by
/// one terminal message. Error messages are always terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
    pub is_last: bool,
}

impl ResponseEnvelope {
    /// Build a terminal successful response.
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: CONTRACT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
            is_last: true,
        }
    }

    /// Build a non-terminal stream message.
    #[must_use]
    pub fn chunk(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            is_last: false,
            ..Self::ok(request_id, payload)
        }
    }

    /// Build a terminal error response.
    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: CONTRACT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
            is_last: true,
        }
    }
}

/// A versioned topic event from host -> UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub topic: Topic,
    /// Instance the event is aimed at; `None` reaches every subscriber.
    pub target: Option<String>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build a v1 event envelope with a fresh event id.
    #[must_use]
    pub fn new(topic: Topic, target: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            v: CONTRACT_VERSION,
            event_id: uuid::Uuid::new_v4().to_string(),
            topic,
            target,
            payload,
        }
    }

    /// Whether a subscriber owned by `owner` should receive this event.
    #[must_use]
    pub fn is_for(&self, owner: Option<&str>) -> bool {
        match (&self.target, owner) {
            (None, _) => true,
            (Some(target), Some(owner)) => target == owner,
            (Some(_), None) => false,
        }
    }
}

/// Contract validation error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
}

/// Contract validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ContractError {}
