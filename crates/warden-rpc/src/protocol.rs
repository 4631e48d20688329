//! Wire protocol types and framing
//!
//! Every exchange is one request frame followed by one response frame. A
//! frame is a 4-byte big-endian length prefix and a JSON payload. Bodies
//! are opaque byte strings; their interpretation belongs to the method
//! being invoked.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Result, RpcError};

/// Status line of a successful response.
pub const STATUS_OK: &str = "200 OK";

/// URL prefix every plugin serves under, as written into `runtime.conf`.
pub const PLUGIN_URL_PREFIX: &str = "unix://plugin";

/// Socket file a plugin creates inside its bundle directory.
pub const PLUGIN_SOCK_FILE: &str = "pluginconn.sock";

/// Runtime configuration file the agent writes into the bundle directory.
pub const RUNTIME_CONF_FILE: &str = "runtime.conf";

/// Reserved URL suffixes (relative to the plugin URL prefix).
pub const ACTIVATE_URL: &str = "/Activate";
pub const STOP_URL: &str = "/Stop";
pub const PING_URL: &str = "/Ping";
pub const REGISTER_CALLBACK_URL: &str = "/RegisterCallback";

/// Method names of the controller lifecycle dispatch contract.
pub const MANAGE_INIT_METHOD: &str = "pluginmanager.manageInit";
pub const MANAGE_START_METHOD: &str = "pluginmanager.manageStart";
pub const MANAGE_STOP_METHOD: &str = "pluginmanager.manageStop";

/// Literal body some plugins return for "no payload"; callers normalize it
/// to an empty body.
pub const NIL_BODY: &[u8] = b"<nil>";

/// Frames larger than this are rejected outright.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// A request to a plugin: a URL naming the operation and an opaque body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginRequest {
    pub url: String,
    pub body: Vec<u8>,
}

impl PluginRequest {
    pub fn new(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            body,
        }
    }
}

/// A response from a plugin. `"200 OK"` means success; any other status is
/// an application-level failure and the body carries the diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginResponse {
    pub status: String,
    pub body: Vec<u8>,
}

impl PluginResponse {
    /// Create a success response
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: STATUS_OK.to_string(),
            body,
        }
    }

    /// Create a failure response with a status line and diagnostic
    pub fn error(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            body: message.into().into_bytes(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }
}

/// Contract written by the agent into the bundle directory before spawning
/// the plugin; tells the child where to serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConf {
    pub url: String,
    #[serde(rename = "sockpath")]
    pub sock: String,
}

impl Default for RuntimeConf {
    fn default() -> Self {
        Self {
            url: PLUGIN_URL_PREFIX.to_string(),
            sock: PLUGIN_SOCK_FILE.to_string(),
        }
    }
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame<W, T>(w: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)?;
    if payload.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(payload.len()));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame<R, T>(r: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes).await?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    Ok(serde_json::from_slice(&payload)?)
}

/// Prefix a controller id onto a method payload: 4-byte big-endian length,
/// the id bytes, then the payload.
pub fn encapsulate_controller_id(controller_id: &str, payload: &[u8]) -> Vec<u8> {
    let id = controller_id.as_bytes();
    let mut out = Vec::with_capacity(4 + id.len() + payload.len());
    out.extend_from_slice(&(id.len() as u32).to_be_bytes());
    out.extend_from_slice(id);
    out.extend_from_slice(payload);
    out
}

/// Split a controller id off a method payload written by
/// [`encapsulate_controller_id`].
pub fn decapsulate_controller_id(data: &[u8]) -> Result<(String, &[u8])> {
    if data.len() < 4 {
        return Err(RpcError::InvalidFrame(
            "payload shorter than controller id length prefix".to_string(),
        ));
    }
    let id_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let rest = &data[4..];
    if rest.len() < id_len {
        return Err(RpcError::InvalidFrame(format!(
            "controller id length {} exceeds payload of {} bytes",
            id_len,
            rest.len()
        )));
    }
    let id = std::str::from_utf8(&rest[..id_len])
        .map_err(|_| RpcError::InvalidFrame("controller id is not valid UTF-8".to_string()))?;
    Ok((id.to_string(), &rest[id_len..]))
}
