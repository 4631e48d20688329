//! Plugin process supervision
//!
//! A `Plugin` owns one child process and the RPC connection into it. The
//! handle moves through spawn → connect → activate before it is usable;
//! a transport failure during `execute` triggers one reconnect-then-reload
//! repair attempt. All live state sits behind one async mutex, which also
//! serializes this plugin's RPCs.

use std::collections::HashSet;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use warden_rpc::protocol::{
    ACTIVATE_URL, NIL_BODY, PING_URL, PLUGIN_SOCK_FILE, PLUGIN_URL_PREFIX, REGISTER_CALLBACK_URL,
    STOP_URL,
};
use warden_rpc::{PluginClient, PluginRequest, RpcError};

use crate::bundle::{write_runtime_conf, PLUGIN_BINARY};
use crate::manifest::VersionPredicate;
use crate::{PluginError, Result};

/// Persisted image of a plugin handle: everything needed to find and
/// respawn the bundle, nothing tied to the live process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginDescriptor {
    pub bundle_dir: PathBuf,
    pub sock_path: PathBuf,
    pub url_prefix: String,
    pub plugin_type: String,
    pub controller: String,
    pub version: VersionPredicate,
}

#[derive(Default, Debug)]
struct PluginState {
    client: Option<PluginClient>,
    pid: Option<i32>,
    connected: bool,
    methods: Vec<String>,
    callbacks: HashSet<String>,
}

/// A supervised plugin child process.
pub struct Plugin {
    bundle_dir: PathBuf,
    sock_path: PathBuf,
    url_prefix: String,
    controller: String,
    plugin_type: String,
    version: VersionPredicate,
    interval: Duration,
    conn_retry_count: u32,
    state: Mutex<PluginState>,
}

impl Plugin {
    fn new(
        bundle_dir: PathBuf,
        sock_path: PathBuf,
        url_prefix: String,
        controller: String,
        plugin_type: String,
        version: VersionPredicate,
        interval: Duration,
        conn_retry_count: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            bundle_dir,
            sock_path,
            url_prefix,
            controller,
            plugin_type,
            version,
            interval,
            conn_retry_count,
            state: Mutex::new(PluginState::default()),
        })
    }

    /// Spawn the bundle's `pluginmain`, connect to its socket and drive it
    /// through `/Activate`. On failure the partially-constructed handle is
    /// unloaded (socket closed, child signalled) before the error is
    /// returned.
    pub(crate) async fn load(
        bundle_dir: &Path,
        controller: &str,
        plugin_type: &str,
        version: VersionPredicate,
        interval: Duration,
        conn_retry_count: u32,
    ) -> Result<Arc<Self>> {
        let plugin = Self::new(
            bundle_dir.to_path_buf(),
            bundle_dir.join(PLUGIN_SOCK_FILE),
            PLUGIN_URL_PREFIX.to_string(),
            controller.to_string(),
            plugin_type.to_string(),
            version,
            interval,
            conn_retry_count,
        );

        let mut state = plugin.state.lock().await;
        if let Err(e) = plugin.spawn_locked(&mut state) {
            // An earlier incarnation may still be serving the socket, so
            // keep going and let the connect attempts decide.
            error!(
                "Failed to start plugin process in {}: {}",
                plugin.bundle_dir.display(),
                e
            );
        }
        if let Err(e) = plugin.connect_locked(&mut state).await {
            plugin.unload_locked(&mut state).await;
            drop(state);
            return Err(e);
        }
        if let Err(e) = plugin.activate_locked(&mut state).await {
            plugin.unload_locked(&mut state).await;
            drop(state);
            return Err(e);
        }
        drop(state);
        Ok(plugin)
    }

    /// Rebuild a handle from its persisted descriptor. The handle starts
    /// disconnected; callers follow up with [`Plugin::reconnect`] or
    /// [`Plugin::reload`].
    pub fn from_descriptor(
        descriptor: PluginDescriptor,
        interval: Duration,
        conn_retry_count: u32,
    ) -> Arc<Self> {
        Self::new(
            descriptor.bundle_dir,
            descriptor.sock_path,
            descriptor.url_prefix,
            descriptor.controller,
            descriptor.plugin_type,
            descriptor.version,
            interval,
            conn_retry_count,
        )
    }

    /// The persistable image of this handle.
    pub fn descriptor(&self) -> PluginDescriptor {
        PluginDescriptor {
            bundle_dir: self.bundle_dir.clone(),
            sock_path: self.sock_path.clone(),
            url_prefix: self.url_prefix.clone(),
            plugin_type: self.plugin_type.clone(),
            controller: self.controller.clone(),
            version: self.version.clone(),
        }
    }

    pub fn controller(&self) -> &str {
        &self.controller
    }

    pub fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    pub fn version(&self) -> &VersionPredicate {
        &self.version
    }

    pub fn bundle_dir(&self) -> &Path {
        &self.bundle_dir
    }

    pub fn sock_path(&self) -> &Path {
        &self.sock_path
    }

    /// Method names the plugin advertised on activation.
    pub async fn methods(&self) -> Vec<String> {
        self.state.lock().await.methods.clone()
    }

    pub async fn connected(&self) -> bool {
        self.state.lock().await.connected
    }

    /// Invoke an advertised method with an opaque body and return the
    /// response body. A `"<nil>"` response is normalized to empty.
    ///
    /// On a transport failure the handle repairs itself with one
    /// reconnect-then-reload attempt; the in-flight request still fails,
    /// but a successful repair serves the next call.
    pub async fn execute(&self, method: &str, body: &[u8]) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(PluginError::NotConnected);
        }
        if !state.methods.iter().any(|m| m == method) {
            return Err(PluginError::MethodNotRegistered(method.to_string()));
        }

        let request = PluginRequest::new(
            format!("{}/{}", self.url_prefix, method),
            body.to_vec(),
        );
        let result = {
            let client = state.client.as_ref().ok_or(PluginError::NotConnected)?;
            client.request(&request).await
        };

        match result {
            Ok(resp) if resp.is_ok() => {
                let mut out = resp.body;
                if out == NIL_BODY {
                    out.clear();
                }
                Ok(out)
            }
            Ok(resp) => Err(RpcError::RequestFailed(resp.status).into()),
            Err(e) if e.is_transport() => {
                warn!(
                    "Transport failure talking to plugin {}: {}",
                    self.controller, e
                );
                state.connected = false;
                state.client = None;
                if let Err(reconnect_err) = self.reconnect_locked(&mut state).await {
                    debug!(
                        "Reconnect to plugin {} failed ({}); reloading",
                        self.controller, reconnect_err
                    );
                    if let Err(reload_err) = self.reload_locked(&mut state).await {
                        error!(
                            "Failed to reload plugin {}: {}",
                            self.controller, reload_err
                        );
                    }
                }
                Err(PluginError::CommunicationFailed)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Liveness probe: the plugin must echo the request body exactly.
    pub async fn ping(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let request = PluginRequest::new(
            format!("{}{}", self.url_prefix, PING_URL),
            b"Test Data".to_vec(),
        );
        let result = {
            let client = state.client.as_ref().ok_or(PluginError::NotConnected)?;
            client.request(&request).await
        };
        match result {
            Ok(resp) if resp.is_ok() => {
                if resp.body == b"Test Data" {
                    Ok(())
                } else {
                    Err(PluginError::CommunicationFailed)
                }
            }
            Ok(resp) => Err(RpcError::RequestFailed(resp.status).into()),
            Err(e) => {
                state.connected = false;
                Err(e.into())
            }
        }
    }

    /// Re-open the socket to the same (still running) process and redo the
    /// activation handshake.
    pub async fn reconnect(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.reconnect_locked(&mut state).await
    }

    /// Unload and respawn the same bundle, rebinding the connection and
    /// pid while keeping the handle's identity.
    pub async fn reload(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        self.reload_locked(&mut state).await
    }

    /// Tear the plugin down: best-effort `/Stop` RPC, close the socket,
    /// SIGUSR1 to the child. Individual failures are logged, never
    /// returned; unloading a half-constructed handle is fine.
    pub async fn unload(&self) {
        let mut state = self.state.lock().await;
        self.unload_locked(&mut state).await;
    }

    /// Register a handler for a plugin-initiated callback. Payloads are
    /// fetched over a dedicated long-poll connection so they never contend
    /// with `execute` traffic. Duplicate registration is rejected.
    pub async fn register_callback<F>(&self, method: &str, handler: F) -> Result<()>
    where
        F: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        let mut state = self.state.lock().await;
        if !state.connected {
            return Err(PluginError::NotConnected);
        }
        if !state.callbacks.insert(method.to_string()) {
            return Err(PluginError::CallbackRegistered(method.to_string()));
        }
        let sock_path = self.sock_path.clone();
        let url = format!("{}{}", self.url_prefix, REGISTER_CALLBACK_URL);
        let body = serde_json::to_vec(method)?;
        let method = method.to_string();
        tokio::spawn(async move {
            callback_loop(sock_path, url, body, method, handler).await;
        });
        Ok(())
    }

    fn spawn_locked(&self, state: &mut PluginState) -> Result<()> {
        let binary = self.bundle_dir.join(PLUGIN_BINARY);
        let mut perms = std::fs::metadata(&binary)?.permissions();
        perms.set_mode(0o777);
        std::fs::set_permissions(&binary, perms)?;

        write_runtime_conf(&self.bundle_dir)?;

        let mut child = Command::new(format!("./{}", PLUGIN_BINARY))
            .current_dir(&self.bundle_dir)
            .spawn()?;
        let pid = child.id().map(|p| p as i32);
        state.pid = pid;
        info!(
            "Started plugin process {:?} for controller {}",
            pid, self.controller
        );
        // Reap the child whenever it exits so it never lingers as a zombie.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });
        Ok(())
    }

    async fn connect_locked(&self, state: &mut PluginState) -> Result<()> {
        tokio::time::sleep(self.interval * 4).await;
        for attempt in 0..self.conn_retry_count {
            debug!(
                "Trying to connect: {} (attempt {})",
                self.sock_path.display(),
                attempt + 1
            );
            match PluginClient::connect(&self.sock_path).await {
                Ok(client) => {
                    state.client = Some(client);
                    return Ok(());
                }
                Err(_) => tokio::time::sleep(self.interval).await,
            }
        }
        Err(PluginError::ConnectFailed)
    }

    async fn activate_locked(&self, state: &mut PluginState) -> Result<()> {
        let request = PluginRequest::new(
            format!("{}{}", self.url_prefix, ACTIVATE_URL),
            Vec::new(),
        );
        let resp = {
            let client = state.client.as_ref().ok_or(PluginError::NotConnected)?;
            client.request(&request).await?
        };
        if !resp.is_ok() {
            return Err(RpcError::RequestFailed(resp.status).into());
        }
        state.methods = serde_json::from_slice(&resp.body)?;
        state.connected = true;
        Ok(())
    }

    async fn reconnect_locked(&self, state: &mut PluginState) -> Result<()> {
        match PluginClient::connect(&self.sock_path).await {
            Ok(client) => {
                state.client = Some(client);
                self.activate_locked(state).await
            }
            Err(e) => {
                state.connected = false;
                debug!(
                    "Failed to reconnect to {}: {}",
                    self.sock_path.display(),
                    e
                );
                Err(PluginError::ConnectFailed)
            }
        }
    }

    async fn reload_locked(&self, state: &mut PluginState) -> Result<()> {
        self.unload_locked(state).await;
        if let Err(e) = self.spawn_locked(state) {
            error!(
                "Failed to start plugin process in {}: {}",
                self.bundle_dir.display(),
                e
            );
        }
        self.connect_locked(state).await?;
        self.activate_locked(state).await
    }

    async fn unload_locked(&self, state: &mut PluginState) {
        if let Some(client) = state.client.take() {
            let request = PluginRequest::new(
                format!("{}{}", self.url_prefix, STOP_URL),
                Vec::new(),
            );
            match client.request(&request).await {
                Ok(resp) if !resp.is_ok() => {
                    warn!(
                        "Plugin {} rejected stop request: {}",
                        self.controller, resp.status
                    );
                }
                Err(e) => warn!("Failed to send stop to plugin {}: {}", self.controller, e),
                _ => {}
            }
        }
        state.connected = false;
        state.callbacks.clear();
        if let Some(pid) = state.pid.take() {
            stop_process(pid);
        }
    }
}

impl std::fmt::Debug for Plugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plugin")
            .field("controller", &self.controller)
            .field("plugin_type", &self.plugin_type)
            .field("version", &self.version)
            .field("bundle_dir", &self.bundle_dir)
            .finish()
    }
}

/// Deliver the plugin's shutdown signal. SIGUSR1, not SIGTERM: that is
/// the signal the plugin binary contract documents.
fn stop_process(pid: i32) {
    let rc = unsafe { libc::kill(pid, libc::SIGUSR1) };
    if rc != 0 {
        error!(
            "Failed to deliver SIGUSR1 to process {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
}

async fn callback_loop<F>(sock_path: PathBuf, url: String, body: Vec<u8>, method: String, handler: F)
where
    F: Fn(Vec<u8>) + Send + Sync + 'static,
{
    // No deadline: a long-poll legitimately blocks until the plugin has a
    // payload for us.
    let client = match PluginClient::connect_with_timeout(&sock_path, None).await {
        Ok(client) => client,
        Err(e) => {
            error!("Failed to open callback channel for {}: {}", method, e);
            return;
        }
    };
    let request = PluginRequest::new(url, body);
    loop {
        match client.request(&request).await {
            Ok(resp) if resp.is_ok() => handler(resp.body),
            Ok(resp) => {
                error!("Callback request for {} failed: {}", method, resp.status);
                return;
            }
            Err(e) => {
                error!("Failed to send callback request for {}: {}", method, e);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_bundle_dir, serve_bundle};
    use warden_rpc::protocol::MANAGE_START_METHOD;
    use warden_rpc::encapsulate_controller_id;

    const TEST_INTERVAL: Duration = Duration::from_millis(20);

    fn exact(v: &str) -> VersionPredicate {
        VersionPredicate::Exact(v.to_string())
    }

    #[tokio::test]
    async fn load_execute_unload() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle_dir(&dir.path().join("demo"), "demo", "1.0");
        let (_server, _running) = serve_bundle(&bundle);

        let plugin = Plugin::load(&bundle, "demo", "lifecycle", exact("1.0"), TEST_INTERVAL, 20)
            .await
            .unwrap();
        assert!(plugin.connected().await);
        assert!(plugin
            .methods()
            .await
            .contains(&MANAGE_START_METHOD.to_string()));

        let out = plugin.execute("demo.echo", b"payload").await.unwrap();
        assert_eq!(out, b"payload");

        // "<nil>" responses are normalized to empty
        let body = encapsulate_controller_id("0", &[]);
        let out = plugin.execute(MANAGE_START_METHOD, &body).await.unwrap();
        assert!(out.is_empty());

        let err = plugin.execute("demo.unknown", &[]).await.unwrap_err();
        assert!(matches!(err, PluginError::MethodNotRegistered(_)));

        plugin.unload().await;
        assert!(!plugin.connected().await);
        let err = plugin.execute("demo.echo", &[]).await.unwrap_err();
        assert!(matches!(err, PluginError::NotConnected));
    }

    #[tokio::test]
    async fn ping_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle_dir(&dir.path().join("demo"), "demo", "1.0");
        let (_server, _running) = serve_bundle(&bundle);

        let plugin = Plugin::load(&bundle, "demo", "lifecycle", exact("1.0"), TEST_INTERVAL, 20)
            .await
            .unwrap();
        plugin.ping().await.unwrap();
        plugin.unload().await;
    }

    #[tokio::test]
    async fn connect_failure_surfaces_after_retries() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle_dir(&dir.path().join("demo"), "demo", "1.0");
        // no server behind the socket

        let err = Plugin::load(&bundle, "demo", "lifecycle", exact("1.0"), TEST_INTERVAL, 3)
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::ConnectFailed));
    }

    #[tokio::test]
    async fn execute_repairs_by_reconnecting() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle_dir(&dir.path().join("demo"), "demo", "1.0");
        let (server, running) = serve_bundle(&bundle);

        let plugin = Plugin::load(&bundle, "demo", "lifecycle", exact("1.0"), TEST_INTERVAL, 20)
            .await
            .unwrap();

        // Kill the connection but put a listener straight back: the repair
        // path should succeed at the reconnect stage.
        running.abort();
        let _running2 = server.bind(bundle.join("pluginconn.sock")).unwrap();

        let err = plugin.execute("demo.echo", b"x").await.unwrap_err();
        assert!(matches!(err, PluginError::CommunicationFailed));

        let out = plugin.execute("demo.echo", b"x").await.unwrap();
        assert_eq!(out, b"x");
        plugin.unload().await;
    }

    #[tokio::test]
    async fn execute_repairs_by_reloading() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle_dir(&dir.path().join("demo"), "demo", "1.0");
        let (server, running) = serve_bundle(&bundle);

        let plugin = Plugin::load(&bundle, "demo", "lifecycle", exact("1.0"), TEST_INTERVAL, 20)
            .await
            .unwrap();

        // Take the endpoint away entirely; reconnect must fail and the
        // reload's connect retries find the endpoint once it reappears.
        running.abort();
        let sock = bundle.join("pluginconn.sock");
        let server2 = server.clone();
        let rebind = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            server2.bind(sock).unwrap()
        });

        let err = plugin.execute("demo.echo", b"x").await.unwrap_err();
        assert!(matches!(err, PluginError::CommunicationFailed));
        let _running2 = rebind.await.unwrap();

        let out = plugin.execute("demo.echo", b"x").await.unwrap();
        assert_eq!(out, b"x");
        plugin.unload().await;
    }

    #[tokio::test]
    async fn callbacks_deliver_and_reject_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle_dir(&dir.path().join("demo"), "demo", "1.0");
        let (server, _running) = serve_bundle(&bundle);

        let plugin = Plugin::load(&bundle, "demo", "lifecycle", exact("1.0"), TEST_INTERVAL, 20)
            .await
            .unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        plugin
            .register_callback("demo.onEvent", move |payload| {
                let _ = tx.send(payload);
            })
            .await
            .unwrap();

        let err = plugin
            .register_callback("demo.onEvent", |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, PluginError::CallbackRegistered(_)));

        server.publish_callback("demo.onEvent", b"one".to_vec());
        server.publish_callback("demo.onEvent", b"two".to_vec());

        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, b"one");
        assert_eq!(second, b"two");
        plugin.unload().await;
    }

    #[tokio::test]
    async fn descriptor_roundtrip_preserves_identity() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = make_bundle_dir(&dir.path().join("demo"), "demo", "1.0");
        let (_server, _running) = serve_bundle(&bundle);

        let plugin = Plugin::load(&bundle, "demo", "lifecycle", exact("1.0"), TEST_INTERVAL, 20)
            .await
            .unwrap();
        let descriptor = plugin.descriptor();
        plugin.unload().await;

        let raw = serde_json::to_vec(&descriptor).unwrap();
        let decoded: PluginDescriptor = serde_json::from_slice(&raw).unwrap();
        let restored = Plugin::from_descriptor(decoded, TEST_INTERVAL, 20);
        assert_eq!(restored.controller(), "demo");
        assert_eq!(restored.plugin_type(), "lifecycle");
        assert_eq!(restored.version(), &exact("1.0"));
        assert_eq!(restored.bundle_dir(), bundle.as_path());
        assert!(!restored.connected().await);

        restored.reconnect().await.unwrap();
        assert!(restored.connected().await);
        let out = restored.execute("demo.echo", b"y").await.unwrap();
        assert_eq!(out, b"y");
        restored.unload().await;
    }
}
