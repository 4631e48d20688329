//! Agent-side RPC client
//!
//! One client owns one Unix-socket connection. Requests are serialized by
//! an internal mutex, so a plugin observes this client's requests in
//! order. Callers that must not contend with a long-poll (the callback
//! loop) open a dedicated client on the same socket path.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::Mutex;

use crate::protocol::{read_frame, write_frame, PluginRequest, PluginResponse};
use crate::{Result, RpcError};

/// Deadline applied to an ordinary request/response exchange.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for the plugin RPC channel.
pub struct PluginClient {
    path: PathBuf,
    stream: Mutex<UnixStream>,
    timeout: Option<Duration>,
}

impl PluginClient {
    /// Connect to the plugin socket with the default request deadline.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        Self::connect_with_timeout(path, Some(DEFAULT_RPC_TIMEOUT)).await
    }

    /// Connect with an explicit request deadline. `None` disables the
    /// deadline; long-poll consumers need that, everything else should
    /// keep one.
    pub async fn connect_with_timeout(
        path: impl AsRef<Path>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path).await?;
        Ok(Self {
            path,
            stream: Mutex::new(stream),
            timeout,
        })
    }

    /// The socket path this client is connected to.
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Issue one request and wait for its response.
    ///
    /// A deadline overrun is reported as [`RpcError::Timeout`]; the
    /// connection is not safe for further exchanges afterwards (a late
    /// response would desynchronize framing), so callers treat it like
    /// any other transport failure and reconnect.
    pub async fn request(&self, request: &PluginRequest) -> Result<PluginResponse> {
        let mut stream = self.stream.lock().await;
        let exchange = async {
            write_frame(&mut *stream, request).await?;
            read_frame::<_, PluginResponse>(&mut *stream).await
        };
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, exchange)
                .await
                .map_err(|_| RpcError::Timeout(limit))?,
            None => exchange.await,
        }
    }
}

impl std::fmt::Debug for PluginClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginClient")
            .field("path", &self.path)
            .field("timeout", &self.timeout)
            .finish()
    }
}
