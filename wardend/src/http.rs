//! HTTP server shell
//!
//! Serves the lifecycle API over TCP, a Unix-domain socket (`Host` of the
//! form `unix://<path>`) or TLS, per the `Mode` setting. Binding and
//! serving are separate steps: the listener is bound early so a bind
//! failure is fatal at startup, and serving starts once the router
//! exists. TLS termination runs its own accept loop with a rustls
//! acceptor in front of hyper.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use axum::Router;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use crate::config::Configuration;

enum ListenerKind {
    Tcp(TcpListener),
    Unix(UnixListener),
    Tls(TcpListener, TlsAcceptor),
}

/// A bound-but-not-yet-serving API listener. Connections arriving before
/// [`ApiListener::serve`] wait in the listen backlog.
pub struct ApiListener {
    addr: String,
    kind: ListenerKind,
}

impl ApiListener {
    /// The address the listener is bound to, for logging.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Start handling requests with the given router.
    pub fn serve(self, router: Router) -> ServerHandle {
        let shutdown = Arc::new(Notify::new());
        let task = match self.kind {
            ListenerKind::Tcp(listener) => {
                let notified = Arc::clone(&shutdown);
                tokio::spawn(async move {
                    let serve = axum::serve(listener, router)
                        .with_graceful_shutdown(async move { notified.notified().await });
                    if let Err(e) = serve.await {
                        warn!("HTTP server error: {}", e);
                    }
                })
            }
            ListenerKind::Unix(listener) => {
                let notified = Arc::clone(&shutdown);
                tokio::spawn(async move {
                    let serve = axum::serve(listener, router)
                        .with_graceful_shutdown(async move { notified.notified().await });
                    if let Err(e) = serve.await {
                        warn!("HTTP server error: {}", e);
                    }
                })
            }
            ListenerKind::Tls(listener, acceptor) => {
                spawn_tls_loop(listener, acceptor, router, Arc::clone(&shutdown))
            }
        };
        ServerHandle {
            addr: self.addr,
            shutdown,
            task,
        }
    }
}

/// A serving HTTP listener; resolves fully on [`ServerHandle::shutdown`].
pub struct ServerHandle {
    addr: String,
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ServerHandle {
    /// The address the server is listening on, for logging.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Stop accepting connections and wait for the serve task to finish.
    pub async fn shutdown(self) {
        debug!("Shutting down http server ({})", self.addr);
        self.shutdown.notify_one();
        let _ = self.task.await;
    }
}

/// Extract the path from a `unix://<path>` address.
fn unix_socket_addr(addr: &str) -> Option<&str> {
    addr.strip_prefix("unix://")
}

/// Bind the API listener per the agent configuration.
pub async fn bind(configuration: &Configuration, start_path: &Path) -> Result<ApiListener> {
    match configuration.mode.as_str() {
        "https" => {
            let cert = start_path.join(&configuration.cert);
            let key = start_path.join(&configuration.key);
            let acceptor = tls_acceptor(&cert, &key)?;
            let addr: SocketAddr = format!("{}:{}", configuration.host, configuration.port)
                .parse()
                .with_context(|| format!("Failed to parse bind address {}", configuration.host))?;
            let listener = TcpListener::bind(addr)
                .await
                .with_context(|| format!("Failed to listen on {}", addr))?;
            info!("HTTPS server listening on https://{}", addr);
            Ok(ApiListener {
                addr: addr.to_string(),
                kind: ListenerKind::Tls(listener, acceptor),
            })
        }
        "http" => {
            if let Some(sock_path) = unix_socket_addr(&configuration.host) {
                if Path::new(sock_path).exists() {
                    warn!("Replacing socket {}", sock_path);
                    std::fs::remove_file(sock_path)
                        .with_context(|| format!("error removing socket file {}", sock_path))?;
                }
                let listener = UnixListener::bind(sock_path)
                    .with_context(|| format!("Failed to listen on {}", sock_path))?;
                info!("HTTP server listening on unix://{}", sock_path);
                Ok(ApiListener {
                    addr: format!("unix://{}", sock_path),
                    kind: ListenerKind::Unix(listener),
                })
            } else {
                let addr: SocketAddr = format!("{}:{}", configuration.host, configuration.port)
                    .parse()
                    .with_context(|| {
                        format!("Failed to parse bind address {}", configuration.host)
                    })?;
                let listener = TcpListener::bind(addr)
                    .await
                    .with_context(|| format!("Failed to listen on {}", addr))?;
                info!("HTTP server listening on http://{}", addr);
                Ok(ApiListener {
                    addr: addr.to_string(),
                    kind: ListenerKind::Tcp(listener),
                })
            }
        }
        other => bail!("Unsupported server mode: {}", other),
    }
}

/// Build a TLS acceptor from PEM certificate and key files.
fn tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let cert_file = File::open(cert_path)
        .with_context(|| format!("Failed to open cert file {}", cert_path.display()))?;
    let key_file = File::open(key_path)
        .with_context(|| format!("Failed to open key file {}", key_path.display()))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<std::result::Result<_, _>>()
        .context("Failed to read certificates")?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .context("Failed to read private key")?
        .context("No private key found")?;
    if certs.is_empty() {
        bail!("No certificates found in {}", cert_path.display());
    }

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("TLS config error")?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

fn spawn_tls_loop(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    router: Router,
    shutdown: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.notified() => break,
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let acceptor = acceptor.clone();
                    let router = router.clone();
                    tokio::spawn(async move {
                        match acceptor.accept(stream).await {
                            Ok(tls_stream) => {
                                let io = TokioIo::new(tls_stream);
                                let service = TowerToHyperService::new(router);
                                if let Err(e) =
                                    http1::Builder::new().serve_connection(io, service).await
                                {
                                    debug!("Connection error from {}: {}", peer_addr, e);
                                }
                            }
                            Err(e) => {
                                debug!("TLS handshake error from {}: {}", peer_addr, e);
                            }
                        }
                    });
                }
            }
        }
    })
}
