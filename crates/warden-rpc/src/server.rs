//! Plugin-side RPC server
//!
//! Serves the reserved URL set plus any registered method URLs on a
//! Unix-domain socket. Each accepted connection gets its own task and is
//! processed one frame at a time, so a single client's requests are
//! totally ordered. Long-poll callback requests park on a per-method
//! channel until the plugin publishes a payload.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::{
    read_frame, write_frame, PluginRequest, PluginResponse, ACTIVATE_URL, PING_URL,
    REGISTER_CALLBACK_URL, STOP_URL,
};
use crate::{Result, RpcError};

/// Handler invoked for a registered method URL. The returned bytes become
/// the response body under a `200 OK` status.
pub type MethodHandler = Arc<dyn Fn(&[u8]) -> Vec<u8> + Send + Sync>;

type StopHook = Arc<dyn Fn() + Send + Sync>;

struct CallbackChannel {
    tx: UnboundedSender<Vec<u8>>,
    rx: Arc<AsyncMutex<UnboundedReceiver<Vec<u8>>>>,
}

/// Per-method payload queues backing the `/RegisterCallback` long-poll.
#[derive(Default)]
pub struct CallbackHub {
    channels: StdMutex<HashMap<String, CallbackChannel>>,
}

impl CallbackHub {
    fn channel(&self, method: &str) -> Arc<AsyncMutex<UnboundedReceiver<Vec<u8>>>> {
        let mut channels = self.channels.lock().unwrap();
        let entry = channels.entry(method.to_string()).or_insert_with(|| {
            let (tx, rx) = unbounded_channel();
            CallbackChannel {
                tx,
                rx: Arc::new(AsyncMutex::new(rx)),
            }
        });
        Arc::clone(&entry.rx)
    }

    /// Queue one callback payload for `method`; the next long-poll
    /// exchange delivers it.
    pub fn publish(&self, method: &str, payload: Vec<u8>) {
        let mut channels = self.channels.lock().unwrap();
        let entry = channels.entry(method.to_string()).or_insert_with(|| {
            let (tx, rx) = unbounded_channel();
            CallbackChannel {
                tx,
                rx: Arc::new(AsyncMutex::new(rx)),
            }
        });
        // The receiver half lives in the same map entry, so this cannot fail.
        let _ = entry.tx.send(payload);
    }
}

struct ServerInner {
    url_prefix: String,
    methods: RwLock<HashMap<String, MethodHandler>>,
    callbacks: CallbackHub,
    stop_hook: RwLock<Option<StopHook>>,
    connections: StdMutex<Vec<JoinHandle<()>>>,
}

/// The plugin-side server: a method table plus the reserved URL behaviors.
#[derive(Clone)]
pub struct PluginServer {
    inner: Arc<ServerInner>,
}

impl PluginServer {
    /// Create a server answering under `url_prefix` (normally the value
    /// the agent wrote into `runtime.conf`).
    pub fn new(url_prefix: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                url_prefix: url_prefix.into(),
                methods: RwLock::new(HashMap::new()),
                callbacks: CallbackHub::default(),
                stop_hook: RwLock::new(None),
                connections: StdMutex::new(Vec::new()),
            }),
        }
    }

    /// Register a method under its advertised name. The name appears in
    /// the `/Activate` response and the method is reachable at
    /// `<prefix>/<name>`.
    pub fn register_method(&self, name: impl Into<String>, handler: MethodHandler) -> Result<()> {
        let name = name.into();
        let mut methods = self.inner.methods.write().unwrap();
        if methods.contains_key(&name) {
            return Err(RpcError::AlreadyRegistered(name));
        }
        methods.insert(name, handler);
        Ok(())
    }

    /// Install a hook invoked when the agent requests `/Stop`.
    pub fn on_stop(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.inner.stop_hook.write().unwrap() = Some(Arc::new(hook));
    }

    /// Publish a callback payload to whichever client long-polls `method`.
    pub fn publish_callback(&self, method: &str, payload: Vec<u8>) {
        self.inner.callbacks.publish(method, payload);
    }

    /// Bind the socket and start serving. A stale socket file from an
    /// earlier process is replaced.
    pub fn bind(&self, sock_path: impl AsRef<Path>) -> Result<RunningServer> {
        let sock_path = sock_path.as_ref();
        if sock_path.exists() {
            warn!("replacing stale socket {}", sock_path.display());
            std::fs::remove_file(sock_path)?;
        }
        let listener = UnixListener::bind(sock_path)?;
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn({
            let inner = Arc::clone(&inner);
            async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let conn = tokio::spawn(handle_connection(Arc::clone(&inner), stream));
                            let mut connections = inner.connections.lock().unwrap();
                            connections.retain(|c| !c.is_finished());
                            connections.push(conn);
                        }
                        Err(e) => {
                            warn!("accept failed on plugin socket: {}", e);
                            break;
                        }
                    }
                }
            }
        });
        Ok(RunningServer { inner, task })
    }
}

/// Handle to a bound server; aborts the accept loop and every live
/// connection on drop.
pub struct RunningServer {
    inner: Arc<ServerInner>,
    task: JoinHandle<()>,
}

impl RunningServer {
    pub fn abort(&self) {
        self.task.abort();
        for conn in self.inner.connections.lock().unwrap().drain(..) {
            conn.abort();
        }
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn handle_connection(inner: Arc<ServerInner>, mut stream: UnixStream) {
    loop {
        let request: PluginRequest = match read_frame(&mut stream).await {
            Ok(req) => req,
            Err(RpcError::Transport(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                debug!("plugin connection closed: {}", e);
                break;
            }
        };
        let response = dispatch(&inner, request).await;
        if let Err(e) = write_frame(&mut stream, &response).await {
            debug!("failed to write response: {}", e);
            break;
        }
    }
}

async fn dispatch(inner: &ServerInner, request: PluginRequest) -> PluginResponse {
    let Some(suffix) = request.url.strip_prefix(inner.url_prefix.as_str()) else {
        return PluginResponse::error(
            "404 Not Found",
            format!("URL outside plugin prefix: {}", request.url),
        );
    };

    match suffix {
        ACTIVATE_URL => {
            let mut names: Vec<String> = inner.methods.read().unwrap().keys().cloned().collect();
            names.sort();
            match serde_json::to_vec(&names) {
                Ok(body) => PluginResponse::ok(body),
                Err(e) => PluginResponse::error("500 Internal Error", e.to_string()),
            }
        }
        PING_URL => PluginResponse::ok(request.body),
        STOP_URL => {
            let hook = inner.stop_hook.read().unwrap().clone();
            if let Some(hook) = hook {
                hook();
            }
            PluginResponse::ok(Vec::new())
        }
        REGISTER_CALLBACK_URL => {
            let method: String = match serde_json::from_slice(&request.body) {
                Ok(name) => name,
                Err(e) => {
                    return PluginResponse::error(
                        "400 Bad Request",
                        format!("callback name is not a JSON string: {}", e),
                    )
                }
            };
            let rx = inner.callbacks.channel(&method);
            let mut rx = rx.lock().await;
            match rx.recv().await {
                Some(payload) => PluginResponse::ok(payload),
                None => PluginResponse::error("500 Internal Error", "callback channel closed"),
            }
        }
        other => {
            let Some(name) = other.strip_prefix('/') else {
                return PluginResponse::error(
                    "404 Not Found",
                    format!("malformed URL: {}", request.url),
                );
            };
            let handler = inner.methods.read().unwrap().get(name).cloned();
            match handler {
                Some(handler) => PluginResponse::ok(handler(&request.body)),
                None => PluginResponse::error(
                    "404 Not Found",
                    format!("no such method: {}", name),
                ),
            }
        }
    }
}
