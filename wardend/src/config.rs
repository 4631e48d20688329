//! Agent configuration
//!
//! Loaded from `conf/warden.conf` next to the agent binary. The file is
//! JSON with PascalCase keys.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Name of the configuration file under the `conf/` directory.
pub const CONF_FILE: &str = "warden.conf";

/// Configuration as loaded from the conf file.
#[derive(Debug, Clone, Deserialize)]
pub struct Configuration {
    /// Bind address: an IP, or `unix://<path>` for a domain socket.
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "LogFile", default)]
    pub log_file: String,
    #[serde(rename = "LogThreshold", default)]
    pub log_threshold: String,
    /// KV store file, relative to the agent's start directory.
    #[serde(rename = "KVStoreName")]
    pub kv_store_name: String,
    /// `http` or `https`.
    #[serde(rename = "Mode", default = "default_mode")]
    pub mode: String,
    #[serde(rename = "Cert", default)]
    pub cert: String,
    #[serde(rename = "Key", default)]
    pub key: String,
}

fn default_mode() -> String {
    "http".to_string()
}

/// Load the configuration file from `<start_path>/conf/`.
pub fn load(start_path: &Path) -> Result<Configuration> {
    let path = start_path.join("conf").join(CONF_FILE);
    let data = std::fs::read(&path)
        .with_context(|| format!("Could not read configuration file {}", path.display()))?;
    serde_json::from_slice(&data)
        .with_context(|| format!("Could not parse configuration file {}", path.display()))
}

/// Map the configured threshold onto a tracing directive. Unknown or
/// empty values fall back to `info`.
pub fn threshold_directive(threshold: &str) -> &'static str {
    match threshold.to_ascii_uppercase().as_str() {
        "TRACE" => "trace",
        "DEBUG" => "debug",
        "INFO" => "info",
        "WARN" => "warn",
        "ERROR" | "CRITICAL" | "FATAL" => "error",
        _ => "info",
    }
}
