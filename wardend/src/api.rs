//! Lifecycle HTTP API
//!
//! Two endpoints, JSON in and out, every response wrapped in the
//! `{"success": "true"|"false", "message": ...}` envelope. Failures are
//! HTTP 400 with an English diagnostic. The controller indices live
//! behind one async mutex so that concurrent starts on the same CIL
//! serialize across the check-then-insert window.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use warden_plugins::{PluginStore, LIFECYCLE_PLUGIN_TYPE};
use warden_store::{KvStore, CONTROLLERS_BUCKET};

pub const API_LIFECYCLE_START: &str = "/v1/api/lifecycle/start";
pub const API_LIFECYCLE_STOP: &str = "/v1/api/lifecycle/stop";

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerStartReq {
    pub name: String,
    pub version: String,
    /// Controller Instance Location: where the controller runs. At most
    /// one running controller per CIL.
    pub cil: String,
    pub deploy: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerStopReq {
    pub cid: String,
}

/// Envelope for every API response.
#[derive(Debug, Serialize)]
pub struct ApiResponse {
    pub success: String,
    pub message: String,
}

impl ApiResponse {
    fn ok(message: impl Into<String>) -> Self {
        Self {
            success: "true".to_string(),
            message: message.into(),
        }
    }

    fn fail(message: impl Into<String>) -> Self {
        Self {
            success: "false".to_string(),
            message: message.into(),
        }
    }
}

/// A running controller instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Controller {
    pub name: String,
    pub version: String,
    pub cil: String,
    pub deploy: String,
    pub cid: String,
}

/// The two agent-wide controller indices plus the cid allocator. Insert
/// and removal always touch both maps under the same lock.
#[derive(Default)]
pub struct ControllerIndex {
    running_by_cil: HashMap<String, Controller>,
    by_cid: HashMap<String, Controller>,
    next_cid: u64,
}

impl ControllerIndex {
    fn allocate_cid(&mut self) -> String {
        let cid = self.next_cid;
        self.next_cid += 1;
        cid.to_string()
    }
}

#[derive(Clone)]
pub struct AppState {
    store: Arc<PluginStore>,
    kv: Arc<KvStore>,
    controllers: Arc<Mutex<ControllerIndex>>,
}

impl AppState {
    pub fn new(store: Arc<PluginStore>, kv: Arc<KvStore>) -> Self {
        Self {
            store,
            kv,
            controllers: Arc::new(Mutex::new(ControllerIndex::default())),
        }
    }

    /// Rebuild the controller indices from the `controllers` bucket so a
    /// stop issued after an agent restart still finds its cid. The cid
    /// allocator resumes past the highest recovered id.
    pub async fn recover(store: Arc<PluginStore>, kv: Arc<KvStore>) -> Self {
        let mut index = ControllerIndex::default();
        match kv.get_all(CONTROLLERS_BUCKET).await {
            Ok(entries) => {
                for (_, value) in entries {
                    let controller: Controller = match serde_json::from_slice(&value) {
                        Ok(controller) => controller,
                        Err(e) => {
                            error!("Undecodable controller in kvstore, skipping: {}", e);
                            continue;
                        }
                    };
                    if let Ok(cid) = controller.cid.parse::<u64>() {
                        index.next_cid = index.next_cid.max(cid + 1);
                    }
                    index
                        .running_by_cil
                        .insert(controller.cil.clone(), controller.clone());
                    index.by_cid.insert(controller.cid.clone(), controller);
                }
            }
            Err(e) => error!("Failed to load controllers from kvstore: {}", e),
        }
        Self {
            store,
            kv,
            controllers: Arc::new(Mutex::new(index)),
        }
    }
}

/// Build the agent's router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(API_LIFECYCLE_START, post(start))
        .route(API_LIFECYCLE_STOP, post(stop))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn bad_request(message: String) -> (StatusCode, Json<ApiResponse>) {
    debug!("{}", message);
    (StatusCode::BAD_REQUEST, Json(ApiResponse::fail(message)))
}

/// Start a controller deployed at a given location.
async fn start(
    State(state): State<AppState>,
    payload: Result<Json<ControllerStartReq>, JsonRejection>,
) -> (StatusCode, Json<ApiResponse>) {
    debug!("Executing API - start");

    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => return bad_request(format!("Invalid request: Failed to decode: {}", e)),
    };

    // Held across the whole handler: the CIL check and the final insert
    // must not interleave with a concurrent start on the same CIL.
    let mut controllers = state.controllers.lock().await;

    if controllers.running_by_cil.contains_key(&req.cil) {
        return bad_request(format!("Controller is already started at: {}", req.cil));
    }

    let plugin = match state
        .store
        .get_or_load(LIFECYCLE_PLUGIN_TYPE, &req.name, &req.version)
        .await
    {
        Ok(plugin) => plugin,
        Err(e) => {
            return bad_request(format!(
                "Failed to load plugin for controller: {} of version: {}: {}",
                req.name, req.version, e
            ))
        }
    };

    let cid = controllers.allocate_cid();
    if let Err(e) = plugin.init(&cid, req.cil.as_bytes()).await {
        return bad_request(format!(
            "Failed to initialize lifecycle plugin for controller: {}: {}",
            req.name, e
        ));
    }
    if let Err(e) = plugin.start(&cid, &[]).await {
        return bad_request(format!(
            "Failed to start lifecycle plugin for controller: {}: {}",
            req.name, e
        ));
    }

    let controller = Controller {
        name: req.name,
        version: req.version,
        cil: req.cil,
        deploy: req.deploy,
        cid: cid.clone(),
    };
    persist_controller(&state.kv, &controller).await;
    controllers
        .by_cid
        .insert(cid.clone(), controller.clone());
    controllers
        .running_by_cil
        .insert(controller.cil.clone(), controller);

    (StatusCode::OK, Json(ApiResponse::ok(cid)))
}

/// Stop the controller identified by its cid.
async fn stop(
    State(state): State<AppState>,
    payload: Result<Json<ControllerStopReq>, JsonRejection>,
) -> (StatusCode, Json<ApiResponse>) {
    debug!("Executing API - stop");

    let Json(req) = match payload {
        Ok(payload) => payload,
        Err(e) => return bad_request(format!("Invalid request: Failed to decode: {}", e)),
    };

    let mut controllers = state.controllers.lock().await;

    let Some(controller) = controllers.by_cid.get(&req.cid).cloned() else {
        return bad_request(format!("Invalid controller id: {}", req.cid));
    };
    if !controllers.running_by_cil.contains_key(&controller.cil) {
        return bad_request(format!("Controller has not started at: {}", controller.cil));
    }

    let plugin = match state
        .store
        .get_or_load(LIFECYCLE_PLUGIN_TYPE, &controller.name, &controller.version)
        .await
    {
        Ok(plugin) => plugin,
        Err(e) => {
            return bad_request(format!(
                "Failed to load plugin for controller: {} of version: {}: {}",
                controller.name, controller.version, e
            ))
        }
    };

    if let Err(e) = plugin.stop(&controller.cid, &[]).await {
        return bad_request(format!(
            "Failed to stop lifecycle plugin for controller: {}: {}",
            controller.name, e
        ));
    }

    controllers.running_by_cil.remove(&controller.cil);
    controllers.by_cid.remove(&controller.cid);
    if let Err(e) = state
        .kv
        .del(CONTROLLERS_BUCKET, controller.cid.as_bytes())
        .await
    {
        error!("Failed to drop controller {} from kvstore: {}", controller.cid, e);
    }

    (StatusCode::OK, Json(ApiResponse::ok("")))
}

/// Persistence failures are logged, never surfaced: a dead KV store costs
/// restart recovery, not live traffic.
async fn persist_controller(kv: &KvStore, controller: &Controller) {
    match serde_json::to_vec(controller) {
        Ok(value) => {
            if let Err(e) = kv
                .set(CONTROLLERS_BUCKET, controller.cid.as_bytes(), &value)
                .await
            {
                error!("Failed to save controller {} in kvstore: {}", controller.cid, e);
            }
        }
        Err(e) => error!("Failed to encode controller {}: {}", controller.cid, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use std::io::Write;
    use std::path::Path;
    use std::time::Duration;
    use tower::ServiceExt;
    use warden_plugins::{PluginRegistry, RegistryConfig};
    use warden_rpc::protocol::{
        MANAGE_INIT_METHOD, MANAGE_START_METHOD, MANAGE_STOP_METHOD, PLUGIN_URL_PREFIX,
    };
    use warden_rpc::{PluginServer, RunningServer};
    use warden_store::KvStore;

    fn build_demo_tar(dir: &Path) {
        let manifest = br#"{"plugin-types":[{"plugin-type":"lifecycle","controllers":[{"name":"demo","equals-version":"1.0"}]}]}"#;
        let file = std::fs::File::create(dir.join("demo.tar")).unwrap();
        let mut builder = tar::Builder::new(file);
        for (name, content) in [
            ("pluginmain", b"#!/bin/sh\nsleep 30\n".as_slice()),
            ("plugin.conf", manifest.as_slice()),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content).unwrap();
        }
        builder.into_inner().unwrap().flush().unwrap();
    }

    fn serve_fake_plugin(bundle_dir: &Path) -> (PluginServer, RunningServer) {
        let server = PluginServer::new(PLUGIN_URL_PREFIX);
        for method in [MANAGE_INIT_METHOD, MANAGE_START_METHOD, MANAGE_STOP_METHOD] {
            server
                .register_method(method, Arc::new(|_: &[u8]| Vec::new()))
                .unwrap();
        }
        let running = server.bind(bundle_dir.join("pluginconn.sock")).unwrap();
        (server, running)
    }

    struct TestAgent {
        store: Arc<PluginStore>,
        kv: Arc<KvStore>,
        _server: PluginServer,
        _running: RunningServer,
    }

    impl TestAgent {
        fn router(&self) -> Router {
            router(AppState::new(Arc::clone(&self.store), Arc::clone(&self.kv)))
        }

        /// The router of a "restarted" agent: same KV store, fresh
        /// in-memory indices rebuilt through recovery.
        async fn restarted_router(&self) -> Router {
            let state = AppState::recover(Arc::clone(&self.store), Arc::clone(&self.kv)).await;
            router(state)
        }
    }

    async fn test_agent(dir: &Path) -> TestAgent {
        build_demo_tar(dir);
        let registry = PluginRegistry::start(RegistryConfig {
            plugin_location: dir.to_path_buf(),
            discovery_interval: Duration::from_millis(20),
            conn_retry_count: 20,
        });
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !registry.is_discovered("demo") {
            assert!(tokio::time::Instant::now() < deadline, "discovery timed out");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let (server, running) = serve_fake_plugin(&dir.join("demo"));

        let kv = Arc::new(KvStore::in_memory().await.unwrap());
        let store = Arc::new(PluginStore::init(registry, Arc::clone(&kv)).await.unwrap());
        TestAgent {
            store,
            kv,
            _server: server,
            _running: running,
        }
    }

    async fn post_json(router: &Router, uri: &str, body: &str) -> (StatusCode, ApiEnvelope) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let envelope: ApiEnvelope = serde_json::from_slice(&bytes).unwrap();
        (status, envelope)
    }

    #[derive(Debug, Deserialize)]
    struct ApiEnvelope {
        success: String,
        message: String,
    }

    #[tokio::test]
    async fn start_stop_cycle_with_monotonic_cids() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let router = agent.router();

        let body = r#"{"name":"demo","version":"1.0","cil":"/a","deploy":"x"}"#;
        let (status, envelope) = post_json(&router, API_LIFECYCLE_START, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.success, "true");
        assert_eq!(envelope.message, "0");

        let (status, envelope) = post_json(&router, API_LIFECYCLE_STOP, r#"{"cid":"0"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.success, "true");

        // the CIL is free again; a new start gets a fresh cid
        let (status, envelope) = post_json(&router, API_LIFECYCLE_START, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.message, "1");
    }

    #[tokio::test]
    async fn duplicate_cil_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let router = agent.router();

        let body = r#"{"name":"demo","version":"1.0","cil":"/a","deploy":"x"}"#;
        let (status, _) = post_json(&router, API_LIFECYCLE_START, body).await;
        assert_eq!(status, StatusCode::OK);

        let (status, envelope) = post_json(&router, API_LIFECYCLE_START, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(envelope.success, "false");
        assert!(envelope.message.contains("already started"));

        // a different CIL is fine
        let other = r#"{"name":"demo","version":"1.0","cil":"/b","deploy":"x"}"#;
        let (status, _) = post_json(&router, API_LIFECYCLE_START, other).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_cid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let router = agent.router();

        let (status, envelope) = post_json(&router, API_LIFECYCLE_STOP, r#"{"cid":"999"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(envelope.message.contains("Invalid controller id"));
    }

    #[tokio::test]
    async fn second_stop_for_the_same_cid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let router = agent.router();

        let body = r#"{"name":"demo","version":"1.0","cil":"/a","deploy":"x"}"#;
        post_json(&router, API_LIFECYCLE_START, body).await;
        let (status, _) = post_json(&router, API_LIFECYCLE_STOP, r#"{"cid":"0"}"#).await;
        assert_eq!(status, StatusCode::OK);

        // the cid index was cleared together with the CIL index
        let (status, envelope) = post_json(&router, API_LIFECYCLE_STOP, r#"{"cid":"0"}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(envelope.message.contains("Invalid controller id"));
    }

    #[tokio::test]
    async fn undiscovered_plugin_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let router = agent.router();

        let body = r#"{"name":"ghost","version":"1.0","cil":"/g","deploy":"x"}"#;
        let (status, envelope) = post_json(&router, API_LIFECYCLE_START, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(envelope.message.contains("Plugin tar not discovered"));
    }

    #[tokio::test]
    async fn malformed_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let router = agent.router();

        let (status, envelope) = post_json(&router, API_LIFECYCLE_START, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(envelope.success, "false");
        assert!(envelope.message.contains("Invalid request"));
    }

    #[tokio::test]
    async fn controller_indices_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let agent = test_agent(dir.path()).await;
        let router = agent.router();

        let body = r#"{"name":"demo","version":"1.0","cil":"/a","deploy":"x"}"#;
        let (status, envelope) = post_json(&router, API_LIFECYCLE_START, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.message, "0");

        // "restart": fresh indices recovered from the KV store
        let router = agent.restarted_router().await;

        // the recovered CIL still blocks duplicate starts
        let (status, envelope) = post_json(&router, API_LIFECYCLE_START, body).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(envelope.message.contains("already started"));

        // the cid allocator resumes past the recovered id
        let other = r#"{"name":"demo","version":"1.0","cil":"/b","deploy":"x"}"#;
        let (status, envelope) = post_json(&router, API_LIFECYCLE_START, other).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.message, "1");

        // and the pre-restart controller can still be stopped
        let (status, envelope) = post_json(&router, API_LIFECYCLE_STOP, r#"{"cid":"0"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(envelope.success, "true");
    }
}
