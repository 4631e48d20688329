//! Controller instance store
//!
//! Maps `ControllerInfo → Plugin` for every loaded lifecycle plugin and
//! mirrors the pairs into the KV store's `plugin_instances` bucket so the
//! agent can rebind them after a restart. Also provides the lifecycle
//! call surface (`init`/`start`/`stop`) that wraps controller-id
//! encapsulation around plugin method execution.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use warden_rpc::protocol::{
    MANAGE_INIT_METHOD, MANAGE_START_METHOD, MANAGE_STOP_METHOD, NIL_BODY,
};
use warden_rpc::encapsulate_controller_id;
use warden_store::{KvStore, PLUGIN_INSTANCES_BUCKET};

use crate::manifest::ControllerInfo;
use crate::plugin::{Plugin, PluginDescriptor};
use crate::registry::PluginRegistry;
use crate::{PluginError, Result};

/// A loaded lifecycle plugin, exposed through the controller lifecycle
/// operations. Request bodies carry the controller id, length-prefixed,
/// ahead of the payload.
#[derive(Clone, Debug)]
pub struct LifecycleHandle {
    plugin: Arc<Plugin>,
}

impl LifecycleHandle {
    /// Register a controller instance with the plugin.
    pub async fn init(&self, controller_id: &str, data: &[u8]) -> Result<()> {
        let body = encapsulate_controller_id(controller_id, data);
        let out = self.plugin.execute(MANAGE_INIT_METHOD, &body).await?;
        diagnostic_to_result(out)
    }

    /// Start a previously initialized controller instance.
    pub async fn start(&self, controller_id: &str, data: &[u8]) -> Result<()> {
        let body = encapsulate_controller_id(controller_id, data);
        let out = self.plugin.execute(MANAGE_START_METHOD, &body).await?;
        diagnostic_to_result(out)
    }

    /// Stop a running controller instance.
    pub async fn stop(&self, controller_id: &str, data: &[u8]) -> Result<()> {
        let body = encapsulate_controller_id(controller_id, data);
        let out = self.plugin.execute(MANAGE_STOP_METHOD, &body).await?;
        diagnostic_to_result(out)
    }

    /// The underlying supervised plugin.
    pub fn plugin(&self) -> &Arc<Plugin> {
        &self.plugin
    }
}

/// An empty or `"<nil>"` body is success; anything else is the
/// controller's diagnostic, passed through verbatim.
fn diagnostic_to_result(body: Vec<u8>) -> Result<()> {
    if body.is_empty() || body == NIL_BODY {
        Ok(())
    } else {
        Err(PluginError::Controller(
            String::from_utf8_lossy(&body).into_owned(),
        ))
    }
}

/// The agent-wide store of loaded plugins, persisted across restarts.
pub struct PluginStore {
    registry: Arc<PluginRegistry>,
    kv: Arc<KvStore>,
    plugins: Mutex<Vec<(ControllerInfo, Arc<Plugin>)>>,
}

impl PluginStore {
    /// Build the store and rebind every plugin persisted by an earlier
    /// agent run.
    pub async fn init(registry: Arc<PluginRegistry>, kv: Arc<KvStore>) -> Result<Self> {
        let store = Self {
            registry,
            kv,
            plugins: Mutex::new(Vec::new()),
        };
        store.recover().await?;
        Ok(store)
    }

    /// Reload the `plugin_instances` bucket: reconnect each descriptor's
    /// plugin, respawn the ones that do not answer, drop the ones whose
    /// bundle has disappeared.
    async fn recover(&self) -> Result<()> {
        let entries = self.kv.get_all(PLUGIN_INSTANCES_BUCKET).await?;
        let mut plugins = self.plugins.lock().await;
        for (key, value) in entries {
            let info: ControllerInfo = match serde_json::from_slice(&key) {
                Ok(info) => info,
                Err(e) => {
                    error!("Undecodable controller info in kvstore, skipping: {}", e);
                    continue;
                }
            };
            let descriptor: PluginDescriptor = match serde_json::from_slice(&value) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    error!(
                        "Undecodable plugin descriptor for {}, skipping: {}",
                        info.name, e
                    );
                    continue;
                }
            };
            if !descriptor.bundle_dir.exists() {
                error!(
                    "Bundle {} for controller {} is gone, dropping persisted plugin",
                    descriptor.bundle_dir.display(),
                    info.name
                );
                if let Err(e) = self.kv.del(PLUGIN_INSTANCES_BUCKET, &key).await {
                    warn!("Failed to drop stale plugin descriptor: {}", e);
                }
                continue;
            }

            let config = self.registry.config();
            let plugin = Plugin::from_descriptor(
                descriptor,
                config.discovery_interval,
                config.conn_retry_count,
            );
            if let Err(reconnect_err) = plugin.reconnect().await {
                warn!(
                    "Failed to reconnect controller {} ({}), respawning",
                    info.name, reconnect_err
                );
                if let Err(reload_err) = plugin.reload().await {
                    error!(
                        "Failed to reload persisted plugin for {}: {}",
                        info.name, reload_err
                    );
                    continue;
                }
            }
            info!("Rebound persisted plugin for controller {}", info.name);
            plugins.push((info, plugin));
        }
        Ok(())
    }

    /// Return the loaded plugin serving `(plugin_type, controller,
    /// version)`, loading it through the registry on first use. A fresh
    /// load is persisted to the KV store; persistence failure is logged
    /// but does not fail the request.
    pub async fn get_or_load(
        &self,
        plugin_type: &str,
        controller: &str,
        version: &str,
    ) -> Result<LifecycleHandle> {
        let mut plugins = self.plugins.lock().await;
        for (info, plugin) in plugins.iter() {
            if info.plugin_type.eq_ignore_ascii_case(plugin_type)
                && info.name == controller
                && info.version.matches(version)
            {
                return Ok(LifecycleHandle {
                    plugin: Arc::clone(plugin),
                });
            }
        }

        let plugin = self
            .registry
            .load_plugin_instance(plugin_type, controller, version)
            .await?;
        let info = ControllerInfo {
            name: controller.to_string(),
            version: plugin.version().clone(),
            plugin_type: plugin.plugin_type().to_string(),
        };

        match (
            serde_json::to_vec(&info),
            serde_json::to_vec(&plugin.descriptor()),
        ) {
            (Ok(key), Ok(value)) => {
                if let Err(e) = self.kv.set(PLUGIN_INSTANCES_BUCKET, &key, &value).await {
                    error!("Failed to save plugin in kvstore: {}", e);
                }
            }
            (Err(e), _) | (_, Err(e)) => {
                error!("Failed to encode plugin descriptor: {}", e);
            }
        }

        plugins.push((info, Arc::clone(&plugin)));
        Ok(LifecycleHandle { plugin })
    }

    /// Number of loaded plugins.
    pub async fn loaded_count(&self) -> usize {
        self.plugins.lock().await.len()
    }

    /// The registry backing this store.
    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Unload every plugin, then stop the discovery loop and wait for it
    /// to drain.
    pub async fn shutdown(&self) {
        let plugins = self.plugins.lock().await;
        for (info, plugin) in plugins.iter() {
            info!("Unloading plugin for controller {}", info.name);
            plugin.unload().await;
        }
        drop(plugins);
        self.registry.stop();
        self.registry.wait_for_stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::VersionPredicate;
    use crate::registry::RegistryConfig;
    use crate::testutil::{build_tar, demo_manifest, serve_bundle};
    use std::time::Duration;

    const TEST_INTERVAL: Duration = Duration::from_millis(20);

    fn test_registry(dir: &std::path::Path) -> Arc<PluginRegistry> {
        PluginRegistry::new(RegistryConfig {
            plugin_location: dir.to_path_buf(),
            discovery_interval: TEST_INTERVAL,
            conn_retry_count: 20,
        })
    }

    async fn discovered_bundle(dir: &std::path::Path) -> Arc<PluginRegistry> {
        build_tar(
            &dir.join("demo.tar"),
            &[
                ("pluginmain", b"#!/bin/sh\nsleep 30\n".as_slice()),
                ("plugin.conf", demo_manifest("demo", "1.0").as_bytes()),
            ],
        );
        let registry = test_registry(dir);
        registry.start_discovery();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !registry.is_discovered("demo") {
            assert!(tokio::time::Instant::now() < deadline, "discovery timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        registry
    }

    #[tokio::test]
    async fn get_or_load_caches_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let registry = discovered_bundle(dir.path()).await;
        let (_server, _running) = serve_bundle(&dir.path().join("demo"));

        let kv = Arc::new(KvStore::in_memory().await.unwrap());
        let store = PluginStore::init(registry, Arc::clone(&kv)).await.unwrap();

        let handle = store.get_or_load("lifecycle", "demo", "1.0").await.unwrap();
        assert_eq!(store.loaded_count().await, 1);

        // second lookup reuses the loaded handle
        let again = store.get_or_load("lifecycle", "demo", "1.0").await.unwrap();
        assert!(Arc::ptr_eq(handle.plugin(), again.plugin()));
        assert_eq!(store.loaded_count().await, 1);

        // the descriptor landed in the bucket
        let persisted = kv.get_all(PLUGIN_INSTANCES_BUCKET).await.unwrap();
        assert_eq!(persisted.len(), 1);
        let info: ControllerInfo = serde_json::from_slice(&persisted[0].0).unwrap();
        assert_eq!(info.name, "demo");
        assert_eq!(info.version, VersionPredicate::Exact("1.0".to_string()));

        handle.init("0", b"/a").await.unwrap();
        handle.start("0", &[]).await.unwrap();
        handle.stop("0", &[]).await.unwrap();

        store.shutdown().await;
    }

    #[tokio::test]
    async fn missing_plugin_is_not_discovered() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let kv = Arc::new(KvStore::in_memory().await.unwrap());
        let store = PluginStore::init(registry, kv).await.unwrap();

        let err = store
            .get_or_load("lifecycle", "ghost", "1.0")
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::NotDiscovered));
    }

    #[tokio::test]
    async fn recovery_rebinds_persisted_plugins() {
        let dir = tempfile::tempdir().unwrap();
        let registry = discovered_bundle(dir.path()).await;
        let (_server, _running) = serve_bundle(&dir.path().join("demo"));

        let kv = Arc::new(KvStore::in_memory().await.unwrap());
        {
            let store = PluginStore::init(Arc::clone(&registry), Arc::clone(&kv))
                .await
                .unwrap();
            store.get_or_load("lifecycle", "demo", "1.0").await.unwrap();
            // simulate an agent restart: the store is dropped, the KV
            // contents and the plugin endpoint survive
        }

        let registry2 = test_registry(dir.path());
        let store = PluginStore::init(registry2, Arc::clone(&kv)).await.unwrap();
        assert_eq!(store.loaded_count().await, 1);

        let handle = store.get_or_load("lifecycle", "demo", "1.0").await.unwrap();
        assert!(handle.plugin().connected().await);
        handle.init("0", b"/a").await.unwrap();
        handle.stop("0", &[]).await.unwrap();
        store.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_drops_descriptors_with_missing_bundles() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path());
        let kv = Arc::new(KvStore::in_memory().await.unwrap());

        let info = ControllerInfo {
            name: "gone".to_string(),
            version: VersionPredicate::Exact("1.0".to_string()),
            plugin_type: "lifecycle".to_string(),
        };
        let descriptor = PluginDescriptor {
            bundle_dir: dir.path().join("gone"),
            sock_path: dir.path().join("gone/pluginconn.sock"),
            url_prefix: "unix://plugin".to_string(),
            plugin_type: "lifecycle".to_string(),
            controller: "gone".to_string(),
            version: VersionPredicate::Exact("1.0".to_string()),
        };
        kv.set(
            PLUGIN_INSTANCES_BUCKET,
            &serde_json::to_vec(&info).unwrap(),
            &serde_json::to_vec(&descriptor).unwrap(),
        )
        .await
        .unwrap();

        let store = PluginStore::init(registry, Arc::clone(&kv)).await.unwrap();
        assert_eq!(store.loaded_count().await, 0);
        assert!(kv
            .get_all(PLUGIN_INSTANCES_BUCKET)
            .await
            .unwrap()
            .is_empty());
    }
}
