//! Agent wiring
//!
//! Startup order: configuration, logging, KV store (fatal on failure),
//! HTTP listener (fatal on failure), then plugin registry and instance
//! recovery; the listener starts serving once the handlers have their
//! state. Shutdown is cooperative: SIGINT/SIGTERM stops the listener,
//! unloads every plugin and drains the discovery loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use warden_plugins::{PluginRegistry, PluginStore, RegistryConfig};
use warden_store::KvStore;

use crate::api;
use crate::config::{self, threshold_directive, Configuration};
use crate::http;

/// Directory watched for plugin bundles, under the agent's start path.
const PLUGIN_DIR: &str = "plugin";

/// Run the agent until it receives SIGINT or SIGTERM.
pub async fn run() -> Result<()> {
    let start_path = start_path()?;
    let configuration = config::load(&start_path)?;
    let _log_guard = init_logging(&configuration);
    info!("Configuration loaded");

    let kv = Arc::new(
        KvStore::open(start_path.join(&configuration.kv_store_name))
            .await
            .context("KV store initialization failed")?,
    );
    info!("KVStore initialized");

    // Only the KV store and this bind may keep the agent from coming up.
    let listener = http::bind(&configuration, &start_path)
        .await
        .context("API server start failed")?;
    info!("API listener bound at {}", listener.addr());

    let plugin_location = start_path.join(PLUGIN_DIR);
    std::fs::create_dir_all(&plugin_location)
        .with_context(|| format!("creating plugin directory {}", plugin_location.display()))?;
    let registry = PluginRegistry::start(RegistryConfig::new(plugin_location));
    let store = Arc::new(
        PluginStore::init(registry, Arc::clone(&kv))
            .await
            .context("Plugin store initialization failed")?,
    );
    info!("Plugin store initialized");

    let state = api::AppState::recover(Arc::clone(&store), Arc::clone(&kv)).await;
    let server = listener.serve(api::router(state));
    info!("APIServer started at {}", server.addr());

    info!("Agent started successfully");
    wait_for_signal().await?;

    info!("Shutting down");
    server.shutdown().await;
    store.shutdown().await;
    kv.close().await;
    info!("Agent stopped");
    Ok(())
}

/// The directory the agent binary runs from; configuration, the KV store
/// and the plugin directory all live relative to it.
fn start_path() -> Result<PathBuf> {
    let exe = std::env::current_exe().context("resolving agent binary path")?;
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

/// Set up tracing: threshold from the config (RUST_LOG wins when set),
/// optionally teeing into the configured log file.
fn init_logging(configuration: &Configuration) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(threshold_directive(&configuration.log_threshold)));

    if configuration.log_file.is_empty() {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    }

    let path = Path::new(&configuration.log_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let file = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("warden.log"));
    let appender = tracing_appender::rolling::never(dir, file);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Some(guard)
}

async fn wait_for_signal() -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    Ok(())
}
