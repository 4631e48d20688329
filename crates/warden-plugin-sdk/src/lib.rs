//! warden-plugin-sdk: build a warden lifecycle plugin
//!
//! A plugin binary implements [`LifecycleController`] for its controller
//! type, hands a registrar to [`PluginRuntime`] and calls
//! [`PluginRuntime::run`]. The runtime reads `runtime.conf` from the
//! working directory (the agent wrote it into the bundle before
//! spawning), serves the plugin protocol on the configured Unix socket
//! and exits cleanly when the agent delivers SIGUSR1 (SIGTERM works too).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use warden_rpc::protocol::{
    MANAGE_INIT_METHOD, MANAGE_START_METHOD, MANAGE_STOP_METHOD, RUNTIME_CONF_FILE,
};
use warden_rpc::{decapsulate_controller_id, MethodHandler, PluginServer, RunningServer, RuntimeConf};

/// One controller instance managed by this plugin. The agent keys
/// instances by the controller id it assigned; `start` and `stop` arrive
/// after `init` registered the instance.
pub trait LifecycleController: Send {
    fn start(&mut self, data: &[u8]) -> Result<()>;
    fn stop(&mut self, data: &[u8]) -> Result<()>;
}

/// Creates a controller instance from the opaque init payload (the
/// controller instance location, for the stock agent).
pub type ControllerRegistrar =
    Arc<dyn Fn(&[u8]) -> Result<Box<dyn LifecycleController>> + Send + Sync>;

type InstanceMap = Arc<Mutex<HashMap<String, Box<dyn LifecycleController>>>>;

/// The plugin-side runtime: protocol server plus the controller instance
/// table behind the `pluginmanager.manage*` methods.
pub struct PluginRuntime {
    server: PluginServer,
    instances: InstanceMap,
}

impl PluginRuntime {
    /// Build a runtime dispatching lifecycle calls through `registrar`.
    pub fn new(url_prefix: impl Into<String>, registrar: ControllerRegistrar) -> Result<Self> {
        let server = PluginServer::new(url_prefix);
        let instances: InstanceMap = Arc::new(Mutex::new(HashMap::new()));

        server
            .register_method(MANAGE_INIT_METHOD, manage_init(&instances, registrar))
            .context("registering manageInit")?;
        server
            .register_method(MANAGE_START_METHOD, manage_start(&instances))
            .context("registering manageStart")?;
        server
            .register_method(MANAGE_STOP_METHOD, manage_stop(&instances))
            .context("registering manageStop")?;

        Ok(Self { server, instances })
    }

    /// Advertise an additional method beyond the lifecycle set.
    pub fn register_method(&self, name: impl Into<String>, handler: MethodHandler) -> Result<()> {
        self.server
            .register_method(name, handler)
            .context("registering plugin method")
    }

    /// Queue a payload for an agent-registered callback long-poll.
    pub fn publish_callback(&self, method: &str, payload: Vec<u8>) {
        self.server.publish_callback(method, payload);
    }

    /// Number of controller instances currently registered.
    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    /// Bind the protocol server on an explicit socket path.
    pub fn serve(&self, sock_path: impl AsRef<std::path::Path>) -> Result<RunningServer> {
        let sock_path = sock_path.as_ref();
        let running = self
            .server
            .bind(sock_path)
            .with_context(|| format!("binding plugin socket {}", sock_path.display()))?;
        info!("Plugin serving on {}", sock_path.display());
        Ok(running)
    }

    /// Run per the bundle contract: read `runtime.conf` from the working
    /// directory, serve on its socket and block until the agent signals
    /// shutdown.
    pub async fn run(self) -> Result<()> {
        let raw = std::fs::read(RUNTIME_CONF_FILE)
            .with_context(|| format!("reading {}", RUNTIME_CONF_FILE))?;
        let conf: RuntimeConf =
            serde_json::from_slice(&raw).with_context(|| format!("parsing {}", RUNTIME_CONF_FILE))?;

        let running = self.serve(&conf.sock)?;
        wait_for_shutdown().await?;
        info!("Shutdown signal received, stopping plugin");
        running.abort();
        Ok(())
    }
}

/// Block until the agent's shutdown signal arrives. SIGUSR1 is the
/// documented signal; SIGTERM is honored for convenience.
pub async fn wait_for_shutdown() -> Result<()> {
    let mut usr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = usr1.recv() => {}
        _ = term.recv() => {}
    }
    Ok(())
}

fn manage_init(instances: &InstanceMap, registrar: ControllerRegistrar) -> MethodHandler {
    let instances = Arc::clone(instances);
    Arc::new(move |body: &[u8]| {
        let (controller_id, data) = match decapsulate_controller_id(body) {
            Ok(parts) => parts,
            Err(e) => return format!("Failed to decode controller id: {}", e).into_bytes(),
        };
        match registrar(data) {
            Ok(instance) => {
                instances.lock().unwrap().insert(controller_id, instance);
                Vec::new()
            }
            Err(e) => format!("Failed to initialize controller instance: {}", e).into_bytes(),
        }
    })
}

fn manage_start(instances: &InstanceMap) -> MethodHandler {
    let instances = Arc::clone(instances);
    Arc::new(move |body: &[u8]| {
        let (controller_id, data) = match decapsulate_controller_id(body) {
            Ok(parts) => parts,
            Err(e) => return format!("Failed to decode controller id: {}", e).into_bytes(),
        };
        let mut instances = instances.lock().unwrap();
        let Some(instance) = instances.get_mut(&controller_id) else {
            return b"Controller instance not initialized".to_vec();
        };
        match instance.start(data) {
            Ok(()) => b"<nil>".to_vec(),
            Err(e) => format!("{}", e).into_bytes(),
        }
    })
}

fn manage_stop(instances: &InstanceMap) -> MethodHandler {
    let instances = Arc::clone(instances);
    Arc::new(move |body: &[u8]| {
        let (controller_id, data) = match decapsulate_controller_id(body) {
            Ok(parts) => parts,
            Err(e) => return format!("Failed to decode controller id: {}", e).into_bytes(),
        };
        let mut instances = instances.lock().unwrap();
        let Some(instance) = instances.get_mut(&controller_id) else {
            return b"Controller instance not initialized".to_vec();
        };
        match instance.stop(data) {
            Ok(()) => b"<nil>".to_vec(),
            Err(e) => format!("{}", e).into_bytes(),
        }
    })
}
