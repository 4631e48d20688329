//! Shared fixtures for the crate's tests: tar construction and fake
//! plugin bundles served by an in-process RPC server.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use warden_rpc::protocol::{
    MANAGE_INIT_METHOD, MANAGE_START_METHOD, MANAGE_STOP_METHOD, PLUGIN_SOCK_FILE,
    PLUGIN_URL_PREFIX,
};
use warden_rpc::{PluginServer, RunningServer};

use crate::bundle::{PLUGIN_BINARY, PLUGIN_CONF_FILE};

pub(crate) fn build_tar(tar_path: &Path, files: &[(&str, &[u8])]) {
    let file = std::fs::File::create(tar_path).unwrap();
    let mut builder = tar::Builder::new(file);
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap().flush().unwrap();
}

pub(crate) fn demo_manifest(name: &str, version: &str) -> String {
    format!(
        r#"{{"plugin-types":[{{"plugin-type":"lifecycle","controllers":[{{"name":"{}","equals-version":"{}"}}]}}]}}"#,
        name, version
    )
}

/// Lay out an extracted bundle directory whose `pluginmain` is a shell
/// script that just sleeps; the RPC endpoint is provided separately by
/// [`serve_bundle`].
pub(crate) fn make_bundle_dir(dir: &Path, controller: &str, version: &str) -> PathBuf {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(PLUGIN_BINARY), b"#!/bin/sh\nsleep 30\n").unwrap();
    std::fs::write(dir.join(PLUGIN_CONF_FILE), demo_manifest(controller, version)).unwrap();
    dir.to_path_buf()
}

/// Stand up an in-process plugin server on the bundle's socket, serving
/// the lifecycle manage methods plus an `echo` method.
pub(crate) fn serve_bundle(bundle_dir: &Path) -> (PluginServer, RunningServer) {
    let server = PluginServer::new(PLUGIN_URL_PREFIX);
    server
        .register_method(MANAGE_INIT_METHOD, Arc::new(|_: &[u8]| Vec::new()))
        .unwrap();
    server
        .register_method(MANAGE_START_METHOD, Arc::new(|_: &[u8]| b"<nil>".to_vec()))
        .unwrap();
    server
        .register_method(MANAGE_STOP_METHOD, Arc::new(|_: &[u8]| b"<nil>".to_vec()))
        .unwrap();
    server
        .register_method("demo.echo", Arc::new(|body: &[u8]| body.to_vec()))
        .unwrap();
    let running = server.bind(bundle_dir.join(PLUGIN_SOCK_FILE)).unwrap();
    (server, running)
}
