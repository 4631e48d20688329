//! warden-plugins: plugin lifecycle management
//!
//! The pieces that take a `.tar` bundle sitting in the discovery directory
//! all the way to a live controller instance:
//!
//! - `manifest`: the bundle manifest and version predicates
//! - `bundle`: on-disk bundle layout and archive extraction
//! - `registry`: the periodic discovery loop and lookup table
//! - `plugin`: one supervised plugin child process
//! - `store`: the controller-instance store persisted in the KV store

pub mod bundle;
pub mod manifest;
pub mod plugin;
pub mod registry;
pub mod store;

#[cfg(test)]
pub(crate) mod testutil;

pub use manifest::{ControllerInfo, PluginConf, VersionPredicate, LIFECYCLE_PLUGIN_TYPE};
pub use plugin::{Plugin, PluginDescriptor};
pub use registry::{PluginRegistry, RegistryConfig};
pub use store::{LifecycleHandle, PluginStore};

use warden_rpc::RpcError;

/// Error types for plugin lifecycle management
#[derive(Debug, thiserror::Error)]
pub enum PluginError {
    #[error("Plugin tar not discovered")]
    NotDiscovered,

    #[error("Plugin connection failed")]
    ConnectFailed,

    #[error("Plugin is not connected")]
    NotConnected,

    #[error("Method is not registered: {0}")]
    MethodNotRegistered(String),

    #[error("Failed to communicate with plugin")]
    CommunicationFailed,

    #[error("Invalid plugin type: {0}")]
    InvalidPluginType(String),

    #[error("Callback is already registered: {0}")]
    CallbackRegistered(String),

    /// Diagnostic returned by the controller implementation, verbatim.
    #[error("{0}")]
    Controller(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Store(#[from] warden_store::StoreError),
}

pub type Result<T> = std::result::Result<T, PluginError>;
