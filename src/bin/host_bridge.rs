//! Headless host binary speaking the JSON protocol over stdin/stdout.
//!
//! All tracing output goes to stderr (and optionally a daily log file) so
//! that stdout remains a clean protocol channel.

use std::path::PathBuf;
use std::sync::Arc;

use tether::config::SecretBackend;
use tether::state::{
    KeyringSecretStore, MemorySecretStore, SecretStore, SettingsStore, TomlSettingsStore,
};
use tether::transport::run_stdio_bridge;
use tether::{Controller, HostConfig, StateManager};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(HostConfig::default_config_path);
    let config = HostConfig::load_or_default(&config_path)
        .map_err(|e| anyhow::anyhow!("failed to load {}: {e}", config_path.display()))?;

    let _log_guard = init_tracing(&config);
    tracing::info!(config = %config_path.display(), "tether-host starting");

    let secret_store: Arc<dyn SecretStore> = match config.storage.secret_backend {
        SecretBackend::Keyring => Arc::new(KeyringSecretStore::new(
            config.storage.secret_service.clone(),
        )),
        SecretBackend::Memory => Arc::new(MemorySecretStore::new()),
    };
    let settings_store: Arc<dyn SettingsStore> = Arc::new(TomlSettingsStore::new(
        config.storage.resolved_settings_path(),
    ));

    let state = StateManager::initialize(secret_store, settings_store).await;
    let controller = Arc::new(
        Controller::builder(Arc::clone(&state))
            .visibility(config.visibility)
            .build(),
    );

    let result = run_stdio_bridge(controller, &config.bridge).await;
    state.flush().await;

    result.map_err(|e| {
        tracing::error!(error = %e, "tether-host exited with error");
        anyhow::anyhow!("tether-host failed: {e}")
    })?;

    tracing::info!("tether-host shut down cleanly");
    Ok(())
}

/// Install the stderr subscriber, plus a daily file sink when enabled.
///
/// The returned guard must live until exit so buffered file output is flushed.
fn init_tracing(config: &HostConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.filter.as_str()));
    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    if !config.logging.file {
        tracing_subscriber::registry()
            .with(filter)
            .with(stderr_layer)
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(tether::dirs::logs_dir(), "tether-host.log");
    let (file_writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();
    Some(guard)
}
