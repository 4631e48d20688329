//! warden-rpc: the RPC channel between the agent and its plugin processes
//!
//! A plugin serves a small URL-addressed protocol over a Unix-domain socket
//! inside its bundle directory. The agent connects as a client and issues
//! framed request/response exchanges; server-initiated callbacks ride on a
//! long-poll URL. Both halves live here:
//!
//! ```text
//! agent side                        plugin side
//! PluginClient ── unix socket ───▶ PluginServer
//!     request {url, body}              routed handler
//!     response {status, body}  ◀──     "200 OK" | diagnostic
//! ```

pub mod client;
pub mod protocol;
pub mod server;

pub use client::{PluginClient, DEFAULT_RPC_TIMEOUT};
pub use protocol::{
    decapsulate_controller_id, encapsulate_controller_id, read_frame, write_frame, PluginRequest,
    PluginResponse, RuntimeConf,
};
pub use server::{CallbackHub, MethodHandler, PluginServer, RunningServer};

use std::time::Duration;

/// Error types for the RPC channel
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport failed: {0}")]
    Transport(#[from] std::io::Error),

    #[error("request failed, status: {0}")]
    RequestFailed(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("frame exceeds limit: {0} bytes")]
    FrameTooLarge(usize),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("already registered: {0}")]
    AlreadyRegistered(String),
}

impl RpcError {
    /// True for failures of the connection itself, as opposed to an
    /// application-level rejection from the peer.
    pub fn is_transport(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
