//! On-disk bundle layout
//!
//! A bundle arrives as `<dir>/<name>.tar` and is extracted into
//! `<dir>/<name>/`, which must contain the `pluginmain` executable and the
//! `plugin.conf` manifest. At load time the agent writes `runtime.conf`
//! next to them; the running plugin creates `pluginconn.sock` there.

use std::path::Path;
use std::time::Duration;

use warden_rpc::protocol::RUNTIME_CONF_FILE;
use warden_rpc::RuntimeConf;

/// Manifest file inside an extracted bundle.
pub const PLUGIN_CONF_FILE: &str = "plugin.conf";

/// Executable inside an extracted bundle.
pub const PLUGIN_BINARY: &str = "pluginmain";

/// Extension identifying bundle archives in the discovery directory.
pub const TAR_EXT: &str = "tar";

/// Default interval for discovery ticks and connect retries.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);

/// Default connection retry count.
pub const CONN_RETRY_COUNT: u32 = 20;

/// Extract a bundle archive into the destination directory.
pub fn extract_bundle(tar_path: &Path, dest_dir: &Path) -> std::io::Result<()> {
    let file = std::fs::File::open(tar_path)?;
    std::fs::create_dir_all(dest_dir)?;
    let mut archive = tar::Archive::new(file);
    archive.unpack(dest_dir)?;
    Ok(())
}

/// Write `runtime.conf` into the bundle directory, telling the plugin
/// where to serve.
pub fn write_runtime_conf(bundle_dir: &Path) -> std::io::Result<()> {
    let conf = RuntimeConf::default();
    let data = serde_json::to_vec_pretty(&conf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(bundle_dir.join(RUNTIME_CONF_FILE), data)
}
