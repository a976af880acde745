//! Controller: routes UI commands to state and provider logic and pushes
//! results and events back through the registry and broker.

pub mod host;
pub mod ui;

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::VisibilityConfig;
use crate::error::{BridgeError, Result};
use crate::provider::{EchoProvider, Provider};
use crate::rpc::contract::{
    CONTRACT_VERSION, CommandEnvelope, CommandName, EventEnvelope, ResponseEnvelope, Topic,
};
use crate::rpc::registry::{PushFn, RequestMetadata, RequestRegistry, noop_cleanup};
use crate::rpc::{StreamingDispatcher, SubscriptionBroker};
use crate::state::{AutoApprovalSettings, Mode, SecretKey, StateManager, TaskBinding};

pub use host::{Clock, HeadlessHost, HostCommand, HostEnvironment, ManualClock, TokioClock};
pub use ui::{UiInstances, UiState};

/// Message shown to the user when no UI instance appears in time.
pub const UI_UNAVAILABLE_MESSAGE: &str =
    "The assistant panel could not be opened. Open it manually and try again.";

/// Orchestrating façade owning the registry, broker and UI instance table.
///
/// Independent controllers share nothing, so several can coexist in one
/// process.
pub struct Controller {
    registry: RequestRegistry,
    dispatcher: StreamingDispatcher,
    broker: SubscriptionBroker,
    state: Arc<StateManager>,
    ui: UiInstances,
    host: Arc<dyn HostEnvironment>,
    provider: Arc<dyn Provider>,
    clock: Arc<dyn Clock>,
    visibility: VisibilityConfig,
    state_forwarder: JoinHandle<()>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("registry", &self.registry)
            .field("active_instance", &self.ui.active())
            .field("provider", &self.provider.name())
            .field("visibility", &self.visibility)
            .finish_non_exhaustive()
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.state_forwarder.abort();
    }
}

/// Builder for [`Controller`]. Collaborators default to a headless host, the
/// echo provider and the tokio clock.
pub struct ControllerBuilder {
    state: Arc<StateManager>,
    host: Arc<dyn HostEnvironment>,
    provider: Arc<dyn Provider>,
    clock: Arc<dyn Clock>,
    visibility: VisibilityConfig,
}

impl ControllerBuilder {
    #[must_use]
    pub fn host(mut self, host: Arc<dyn HostEnvironment>) -> Self {
        self.host = host;
        self
    }

    #[must_use]
    pub fn provider(mut self, provider: Arc<dyn Provider>) -> Self {
        self.provider = provider;
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn visibility(mut self, visibility: VisibilityConfig) -> Self {
        self.visibility = visibility;
        self
    }

    /// Spawn the broker and state forwarder on the current runtime.
    #[must_use]
    pub fn build(self) -> Controller {
        let registry = RequestRegistry::new();
        let broker = SubscriptionBroker::spawn(registry.clone());
        let state_forwarder = spawn_state_forwarder(&self.state, broker.clone());
        Controller {
            dispatcher: StreamingDispatcher::new(registry.clone()),
            registry,
            broker,
            state: self.state,
            ui: UiInstances::new(),
            host: self.host,
            provider: self.provider,
            clock: self.clock,
            visibility: self.visibility,
            state_forwarder,
        }
    }
}

impl Controller {
    #[must_use]
    pub fn builder(state: Arc<StateManager>) -> ControllerBuilder {
        ControllerBuilder {
            state,
            host: Arc::new(HeadlessHost),
            provider: Arc::new(EchoProvider),
            clock: Arc::new(TokioClock::default()),
            visibility: VisibilityConfig::default(),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &RequestRegistry {
        &self.registry
    }

    #[must_use]
    pub fn broker(&self) -> &SubscriptionBroker {
        &self.broker
    }

    #[must_use]
    pub fn state(&self) -> &Arc<StateManager> {
        &self.state
    }

    #[must_use]
    pub fn ui(&self) -> &UiInstances {
        &self.ui
    }

    // ── instance lifecycle ──

    /// First resolution of a UI instance: it becomes visible and active.
    pub fn resolve_instance(&self, instance_id: &str) -> bool {
        let resolved = self.ui.mark_visible(instance_id);
        if resolved {
            info!(instance_id = %instance_id, "ui instance attached");
        }
        resolved
    }

    /// Tear down a UI instance and run the cleanup of every request it owns.
    pub fn dispose_instance(&self, instance_id: &str) -> usize {
        if !self.ui.dispose(instance_id) {
            return 0;
        }
        let released = self.registry.unregister_owner(instance_id);
        info!(instance_id = %instance_id, released, "ui instance disposed");
        released
    }

    /// Make sure some UI instance is visible.
    ///
    /// Always issues the focus host command, so a hidden panel is revealed
    /// even when an instance is already attached, then polls up to the
    /// configured bound. On timeout the user sees one error message and
    /// `None` is returned; a failed focus command is treated the same as a UI
    /// that never shows.
    pub async fn ensure_ui_visible(&self) -> Option<String> {
        if let Err(e) = self.host.execute_command(HostCommand::FocusChatInput).await {
            warn!(error = %e, "focus host command failed");
        }

        let deadline = self.clock.now() + self.visibility.timeout();
        loop {
            if let Some(instance_id) = self.ui.active() {
                return Some(instance_id);
            }
            if self.clock.now() >= deadline {
                break;
            }
            self.clock.sleep(self.visibility.poll_interval()).await;
        }

        warn!(
            timeout_ms = self.visibility.timeout_ms,
            "no ui instance became visible"
        );
        self.host.show_error_message(UI_UNAVAILABLE_MESSAGE).await;
        None
    }

    /// Ask the active UI to focus its chat input.
    pub async fn focus_chat_input(&self) -> Option<String> {
        let instance_id = self.ensure_ui_visible().await?;
        self.broker.publish(EventEnvelope::new(
            Topic::FocusChatInput,
            Some(instance_id.clone()),
            json!({}),
        ));
        Some(instance_id)
    }

    /// Ask the active UI to open its file picker, optionally pre-filtered.
    pub async fn trigger_file_picker(&self, filter: Option<String>) -> Option<String> {
        let instance_id = self.ensure_ui_visible().await?;
        let payload = match filter {
            Some(filter) => json!({ "filter": filter }),
            None => json!({}),
        };
        self.broker.publish(EventEnvelope::new(
            Topic::FilePicker,
            Some(instance_id.clone()),
            payload,
        ));
        Some(instance_id)
    }

    // ── command routing ──

    /// Handle one inbound command from `instance_id`.
    ///
    /// Every outcome, including malformed input, is delivered through `push`;
    /// nothing propagates back to the caller.
    pub async fn handle_command(&self, instance_id: &str, envelope: CommandEnvelope, push: PushFn) {
        if let Err(e) = envelope.validate() {
            warn!(request_id = %envelope.request_id, error = %e, "rejecting malformed command");
            let _ = push(ResponseEnvelope::error(envelope.request_id, e.to_string()));
            return;
        }

        let CommandEnvelope {
            request_id,
            command,
            payload,
            ..
        } = envelope;
        debug!(request_id = %request_id, command = command.as_str(), instance_id = %instance_id, "command received");

        if !command.is_streaming() {
            self.handle_unary(instance_id, request_id, command, &payload, push)
                .await;
            return;
        }

        match command {
            CommandName::StateSubscribe => {
                self.subscribe(instance_id, request_id, Topic::State, push);
            }
            CommandName::UiSubscribe => match parse_topic(&payload) {
                Ok(topic) => self.subscribe(instance_id, request_id, topic, push),
                Err(e) => {
                    let _ = push(ResponseEnvelope::error(request_id, e.to_string()));
                }
            },
            CommandName::ProviderStream => {
                self.start_provider_stream(instance_id, request_id, &payload, push);
            }
            unary => {
                let _ = push(ResponseEnvelope::error(
                    request_id,
                    format!("{} is not a streaming command", unary.as_str()),
                ));
            }
        }
    }

    async fn handle_unary(
        &self,
        instance_id: &str,
        request_id: String,
        command: CommandName,
        payload: &Value,
        push: PushFn,
    ) {
        self.registry.register(
            request_id.clone(),
            noop_cleanup(),
            RequestMetadata::owned_by(instance_id).with_tag(command.as_str()),
            Some(push),
        );
        let responder = self.dispatcher.responder(request_id.clone());
        let delivered = match self.route_unary(instance_id, command, payload).await {
            Ok(result) => responder.finish(result),
            Err(e) => {
                debug!(request_id = %request_id, command = command.as_str(), error = %e, "command failed");
                responder.fail(e.to_string())
            }
        };
        if let Err(e) = delivered {
            debug!(request_id = %request_id, error = %e, "response not delivered");
        }
    }

    async fn route_unary(&self, instance_id: &str, command: CommandName, payload: &Value) -> Result<Value> {
        match command {
            CommandName::HostPing => Ok(json!({ "pong": true, "contract_version": CONTRACT_VERSION })),
            CommandName::StateGet => Ok(self.state.state_snapshot()),
            CommandName::SettingsUpdate => {
                let settings = parse_settings(payload)?;
                let updated = settings.len();
                self.state.set_global_state_batch(settings)?;
                Ok(json!({ "updated": updated }))
            }
            CommandName::SettingsReset => {
                self.state.reset_global_settings();
                Ok(json!({ "reset": true }))
            }
            CommandName::SecretsSet => {
                let secrets = parse_secrets(payload)?;
                let mut stored: Vec<&str> = secrets.keys().map(|key| key.as_str()).collect();
                stored.sort_unstable();
                let stored = json!({ "stored": stored });
                self.state.set_secrets_batch(secrets);
                Ok(stored)
            }
            CommandName::SecretsDelete => {
                let key = parse_secret_key(payload)?;
                self.state.delete_secret(key);
                Ok(json!({ "deleted": key.as_str() }))
            }
            CommandName::ModeSet => {
                let mode = parse_mode(payload)?;
                self.state.set_mode(mode);
                Ok(json!({ "mode": mode }))
            }
            CommandName::TaskStart => {
                let task_id = required_str(payload, "task_id", command)?;
                let binding: Arc<dyn TaskBinding> = Arc::new(RemoteTask {
                    task_id: task_id.clone(),
                    instance_id: instance_id.to_owned(),
                });
                self.state.start_task(task_id.clone(), Some(binding));
                Ok(json!({ "task_id": task_id }))
            }
            CommandName::TaskSetOverride => {
                let key = required_str(payload, "key", command)?;
                let value = payload.get("value").cloned().unwrap_or(Value::Null);
                self.state.set_task_override(key.clone(), value)?;
                Ok(json!({ "key": key }))
            }
            CommandName::TaskClear => {
                self.state.clear_task();
                Ok(json!({ "cleared": true }))
            }
            CommandName::AutoApprovalUpdate => {
                let incoming = parse_auto_approval(payload)?;
                let outcome = self.state.update_versioned_setting(incoming)?;
                Ok(json!({
                    "applied": outcome.is_applied(),
                    "current_version": outcome.current_version(),
                }))
            }
            CommandName::UiFocusChatInput => Ok(availability(self.focus_chat_input().await)),
            CommandName::UiTriggerFilePicker => {
                let filter = payload
                    .get("filter")
                    .and_then(Value::as_str)
                    .map(str::to_owned);
                Ok(availability(self.trigger_file_picker(filter).await))
            }
            CommandName::RequestCancel => {
                let target = required_str(payload, "request_id", command)?;
                let owned = self
                    .registry
                    .metadata(&target)
                    .is_some_and(|meta| meta.owner.as_deref() == Some(instance_id));
                let cancelled = owned && self.registry.unregister(&target);
                Ok(json!({ "request_id": target, "cancelled": cancelled }))
            }
            CommandName::StateSubscribe | CommandName::UiSubscribe | CommandName::ProviderStream => {
                Err(BridgeError::Contract(format!(
                    "{} is a streaming command",
                    command.as_str()
                )))
            }
        }
    }

    fn subscribe(&self, instance_id: &str, request_id: String, topic: Topic, push: PushFn) {
        let subscription_id =
            self.broker
                .subscribe(topic, push, Some(request_id), Some(instance_id.to_owned()));
        if topic == Topic::State {
            // Seed the subscriber with the current snapshot.
            let _ = self
                .dispatcher
                .push(&subscription_id, self.state.state_snapshot(), false);
        }
    }

    fn start_provider_stream(&self, instance_id: &str, request_id: String, payload: &Value, push: PushFn) {
        let prompt = match required_str(payload, "prompt", CommandName::ProviderStream) {
            Ok(prompt) => prompt,
            Err(e) => {
                let _ = push(ResponseEnvelope::error(request_id, e.to_string()));
                return;
            }
        };

        let cancel = CancellationToken::new();
        let on_unregister = cancel.clone();
        self.registry.register(
            request_id.clone(),
            Box::new(move || on_unregister.cancel()),
            RequestMetadata::owned_by(instance_id).with_tag(CommandName::ProviderStream.as_str()),
            Some(push),
        );

        let dispatcher = self.dispatcher.clone();
        let provider = Arc::clone(&self.provider);
        let config = self.state.get_api_configuration();
        tokio::spawn(async move {
            let started = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                started = provider.stream(&config, config.mode, &prompt) => started,
            };
            let chunks = match started {
                Ok(chunks) => chunks,
                Err(e) => {
                    let _ = dispatcher.push_error(&request_id, e.to_string());
                    return;
                }
            };
            let payloads = chunks.map(|item| {
                item.and_then(|chunk| {
                    serde_json::to_value(chunk).map_err(|e| BridgeError::Provider(e.to_string()))
                })
            });
            let outcome = dispatcher.forward(&request_id, payloads, &cancel).await;
            debug!(request_id = %request_id, provider = provider.name(), ?outcome, "provider stream ended");
        });
    }
}

/// Task started over the wire. Versioned settings reach it as soon as they
/// are applied.
struct RemoteTask {
    task_id: String,
    instance_id: String,
}

impl TaskBinding for RemoteTask {
    fn on_versioned_setting(&self, key: &str, value: &Value) {
        debug!(
            task_id = %self.task_id,
            instance_id = %self.instance_id,
            key,
            version = value.get("version").and_then(serde_json::Value::as_u64),
            "versioned setting applied to task"
        );
    }
}

fn spawn_state_forwarder(state: &Arc<StateManager>, broker: SubscriptionBroker) -> JoinHandle<()> {
    let mut changes = state.subscribe_changes();
    let state = Arc::downgrade(state);
    tokio::spawn(async move {
        loop {
            match changes.recv().await {
                Ok(change) => debug!(?change, "state changed"),
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "state forwarder lagged; pushing latest snapshot");
                }
                Err(RecvError::Closed) => break,
            }
            let Some(state) = state.upgrade() else {
                break;
            };
            broker.publish(EventEnvelope::new(Topic::State, None, state.state_snapshot()));
        }
    })
}

fn availability(instance_id: Option<String>) -> Value {
    match instance_id {
        Some(instance_id) => json!({ "available": true, "instance_id": instance_id }),
        None => json!({ "available": false }),
    }
}

fn required_str(payload: &Value, field: &str, command: CommandName) -> Result<String> {
    let Some(raw) = payload.get(field).and_then(Value::as_str) else {
        return Err(BridgeError::Contract(format!(
            "{} requires payload.{field}",
            command.as_str()
        )));
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::Contract(format!(
            "{} requires a non-empty {field}",
            command.as_str()
        )));
    }
    Ok(trimmed.to_owned())
}

fn parse_topic(payload: &Value) -> Result<Topic> {
    let raw = required_str(payload, "topic", CommandName::UiSubscribe)?;
    Topic::parse(&raw).ok_or_else(|| BridgeError::Contract(format!("unknown topic `{raw}`")))
}

fn parse_mode(payload: &Value) -> Result<Mode> {
    let raw = required_str(payload, "mode", CommandName::ModeSet)?;
    Mode::parse(&raw).ok_or_else(|| {
        BridgeError::Contract(format!("unsupported mode `{raw}` (expected plan/act)"))
    })
}

fn parse_settings(payload: &Value) -> Result<HashMap<String, Value>> {
    let Some(settings) = payload.get("settings").and_then(Value::as_object) else {
        return Err(BridgeError::Contract(
            "settings.update requires payload.settings object".to_owned(),
        ));
    };
    Ok(settings
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect())
}

fn parse_secrets(payload: &Value) -> Result<HashMap<SecretKey, String>> {
    let Some(secrets) = payload.get("secrets").and_then(Value::as_object) else {
        return Err(BridgeError::Contract(
            "secrets.set requires payload.secrets object".to_owned(),
        ));
    };
    secrets
        .iter()
        .map(|(name, value)| {
            let key = SecretKey::parse(name)
                .ok_or_else(|| BridgeError::Contract(format!("unknown secret `{name}`")))?;
            let value = value.as_str().ok_or_else(|| {
                BridgeError::Contract(format!("secret `{name}` must be a string"))
            })?;
            Ok((key, value.to_owned()))
        })
        .collect()
}

fn parse_secret_key(payload: &Value) -> Result<SecretKey> {
    let raw = required_str(payload, "key", CommandName::SecretsDelete)?;
    SecretKey::parse(&raw).ok_or_else(|| BridgeError::Contract(format!("unknown secret `{raw}`")))
}

fn parse_auto_approval(payload: &Value) -> Result<AutoApprovalSettings> {
    let Some(settings) = payload.get("settings") else {
        return Err(BridgeError::Contract(
            "auto_approval.update requires payload.settings".to_owned(),
        ));
    };
    if settings.get("version").and_then(Value::as_u64).is_none() {
        return Err(BridgeError::Contract(
            "auto_approval.update requires settings.version".to_owned(),
        ));
    }
    serde_json::from_value(settings.clone())
        .map_err(|e| BridgeError::Contract(format!("invalid auto approval settings: {e}")))
}
