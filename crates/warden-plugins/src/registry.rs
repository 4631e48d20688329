//! Bundle discovery registry
//!
//! Watches the plugin directory on a fixed interval. Each tick extracts
//! newly appeared `.tar` bundles, parses their manifests and registers
//! `(controller, version predicate) → bundle directory` entries. Nothing
//! in a tick is fatal; failures are logged and retried on the next pass
//! because the failed basename is only marked discovered after the whole
//! bundle registered.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::bundle::{extract_bundle, CONN_RETRY_COUNT, DEFAULT_INTERVAL, PLUGIN_CONF_FILE, TAR_EXT};
use crate::manifest::{ControllerInfo, PluginConf, VersionPredicate, LIFECYCLE_PLUGIN_TYPE};
use crate::plugin::Plugin;
use crate::{PluginError, Result};

/// Configuration for a plugin registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Directory to watch for bundle archives.
    pub plugin_location: PathBuf,
    /// Delay between discovery ticks; also paces connect retries.
    pub discovery_interval: Duration,
    /// How many times to retry the first connection to a fresh plugin.
    pub conn_retry_count: u32,
}

impl RegistryConfig {
    pub fn new(plugin_location: impl Into<PathBuf>) -> Self {
        Self {
            plugin_location: plugin_location.into(),
            discovery_interval: DEFAULT_INTERVAL,
            conn_retry_count: CONN_RETRY_COUNT,
        }
    }
}

/// Tracks discovered bundles and which of them serves which controller.
pub struct PluginRegistry {
    config: RegistryConfig,
    discovered: Mutex<HashSet<String>>,
    lifecycle_plugins: Mutex<Vec<(ControllerInfo, PathBuf)>>,
    stop_flag: AtomicBool,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PluginRegistry {
    /// Create a registry without starting the discovery loop.
    pub fn new(config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            discovered: Mutex::new(HashSet::new()),
            lifecycle_plugins: Mutex::new(Vec::new()),
            stop_flag: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Create a registry and start discovering.
    pub fn start(config: RegistryConfig) -> Arc<Self> {
        let registry = Self::new(config);
        registry.start_discovery();
        registry
    }

    /// Spawn the discovery loop.
    pub fn start_discovery(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!(
                "Watching {} for plugin bundles",
                registry.config.plugin_location.display()
            );
            loop {
                if registry.stop_flag.load(Ordering::SeqCst) {
                    break;
                }
                let reg = Arc::clone(&registry);
                // Archive extraction is blocking work.
                if let Err(e) = tokio::task::spawn_blocking(move || reg.tick()).await {
                    error!("Discovery tick panicked: {}", e);
                }
                tokio::time::sleep(registry.config.discovery_interval).await;
            }
            debug!("Discovery loop stopped");
        });
        *self.task.lock().unwrap() = Some(handle);
    }

    /// One discovery pass over the plugin directory.
    fn tick(&self) {
        let entries = match std::fs::read_dir(&self.config.plugin_location) {
            Ok(entries) => entries,
            Err(e) => {
                error!(
                    "Failed to read plugin location {}: {}",
                    self.config.plugin_location.display(),
                    e
                );
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) != Some(TAR_EXT) {
                continue;
            }
            let Some(tar_name) = path.file_stem().and_then(|s| s.to_str()).map(String::from)
            else {
                continue;
            };
            if self.discovered.lock().unwrap().contains(&tar_name) {
                continue;
            }

            let bundle_dir = self.config.plugin_location.join(&tar_name);
            if let Err(e) = extract_bundle(&path, &bundle_dir) {
                error!("Failed to untar the file {}: {}", path.display(), e);
                continue;
            }

            let conf_file = bundle_dir.join(PLUGIN_CONF_FILE);
            let conf = match PluginConf::load(&conf_file) {
                Ok(conf) => conf,
                Err(e) => {
                    error!(
                        "Configuration load failed for file {}: {}",
                        conf_file.display(),
                        e
                    );
                    continue;
                }
            };

            self.register_manifest(&tar_name, &bundle_dir, &conf);
            self.discovered.lock().unwrap().insert(tar_name);
        }
    }

    fn register_manifest(&self, tar_name: &str, bundle_dir: &PathBuf, conf: &PluginConf) {
        let mut table = self.lifecycle_plugins.lock().unwrap();
        for plugin_type in &conf.plugin_types {
            if !plugin_type
                .plugin_type
                .eq_ignore_ascii_case(LIFECYCLE_PLUGIN_TYPE)
            {
                error!(
                    "Invalid plugin type {}, ignoring for plugin {}",
                    plugin_type.plugin_type, tar_name
                );
                continue;
            }
            for controller in &plugin_type.controllers {
                let info = ControllerInfo {
                    name: controller.name.clone(),
                    version: controller.predicate(),
                    plugin_type: LIFECYCLE_PLUGIN_TYPE.to_string(),
                };
                info!(
                    "Discovered lifecycle controller {} {} in {}",
                    info.name,
                    info.version,
                    bundle_dir.display()
                );
                table.push((info, bundle_dir.clone()));
            }
        }
    }

    /// Whether a bundle with this tar basename has been discovered.
    pub fn is_discovered(&self, tar_name: &str) -> bool {
        self.discovered.lock().unwrap().contains(tar_name)
    }

    /// Find the bundle serving `(controller, version)`: first matching
    /// entry in registration order.
    pub fn lookup_lifecycle(
        &self,
        controller: &str,
        version: &str,
    ) -> Option<(PathBuf, VersionPredicate)> {
        let table = self.lifecycle_plugins.lock().unwrap();
        table
            .iter()
            .find(|(info, _)| info.name == controller && info.version.matches(version))
            .map(|(info, dir)| (dir.clone(), info.version.clone()))
    }

    /// Spawn, connect and activate the plugin serving
    /// `(plugin_type, controller, version)`.
    pub async fn load_plugin_instance(
        &self,
        plugin_type: &str,
        controller: &str,
        version: &str,
    ) -> Result<Arc<Plugin>> {
        if !plugin_type.eq_ignore_ascii_case(LIFECYCLE_PLUGIN_TYPE) {
            return Err(PluginError::InvalidPluginType(plugin_type.to_string()));
        }
        let (bundle_dir, predicate) = self
            .lookup_lifecycle(controller, version)
            .ok_or(PluginError::NotDiscovered)?;

        Plugin::load(
            &bundle_dir,
            controller,
            LIFECYCLE_PLUGIN_TYPE,
            predicate,
            self.config.discovery_interval,
            self.config.conn_retry_count,
        )
        .await
    }

    /// The registry configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Ask the discovery loop to end; it observes the flag at the top of
    /// its next tick.
    pub fn stop(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    /// Wait for the discovery loop to drain after [`PluginRegistry::stop`].
    pub async fn wait_for_stop(&self) {
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
