//! Connection router: the single accept loop on the public TLS port
//!
//! Every connection is TLS-terminated with a certificate chosen by SNI,
//! then dispatched on the recorded server name: the admin domain goes to
//! the admin listener queue, a registered tunnel domain is spliced to its
//! loopback port, and anything else receives a courtesy HTTP 500 before
//! the connection closes.

use crate::admin_listener::AdminQueue;
use rustls::ServerConfig;
use skylift_cert::CertStore;
use skylift_registry::TunnelRegistry;
use skylift_splice::splice;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ConnectionRouter {
    bind_addr: SocketAddr,
    admin_domain: String,
    registry: Arc<TunnelRegistry>,
    resolver: Arc<CertStore>,
    admin_queue: AdminQueue,
}

impl ConnectionRouter {
    pub fn new(
        bind_addr: SocketAddr,
        admin_domain: String,
        registry: Arc<TunnelRegistry>,
        resolver: Arc<CertStore>,
        admin_queue: AdminQueue,
    ) -> Self {
        Self {
            bind_addr,
            admin_domain,
            registry,
            resolver,
            admin_queue,
        }
    }

    /// Bind the public port and run the accept loop. Only binding can
    /// fail; accept errors are transient and never kill the edge.
    pub async fn run(self) -> Result<(), RouterError> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .map_err(|source| RouterError::Bind {
                addr: self.bind_addr,
                source,
            })?;
        self.run_on(listener).await
    }

    /// Run the accept loop on an already-bound listener.
    pub async fn run_on(self, listener: TcpListener) -> Result<(), RouterError> {
        skylift_cert::ensure_crypto_provider();

        // No default certificate and no ALPN: a ClientHello without SNI
        // finds no certificate and the handshake fails.
        let tls_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver.clone());
        let acceptor = TlsAcceptor::from(Arc::new(tls_config));

        info!(addr = %listener.local_addr()?, "connection router listening");

        loop {
            let (stream, peer_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("accept error: {}", e);
                    continue;
                }
            };

            let acceptor = acceptor.clone();
            let registry = self.registry.clone();
            let admin_queue = self.admin_queue.clone();
            let admin_domain = self.admin_domain.clone();
            tokio::spawn(async move {
                handle_connection(
                    acceptor,
                    stream,
                    peer_addr,
                    admin_domain,
                    registry,
                    admin_queue,
                )
                .await;
            });
        }
    }
}

async fn handle_connection(
    acceptor: TlsAcceptor,
    stream: TcpStream,
    peer_addr: SocketAddr,
    admin_domain: String,
    registry: Arc<TunnelRegistry>,
    admin_queue: AdminQueue,
) {
    // Completing the handshake here guarantees the server name is known
    // before dispatch.
    let tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            debug!(peer = %peer_addr, "TLS handshake failed: {}", e);
            return;
        }
    };

    let Some(server_name) = tls_stream.get_ref().1.server_name().map(str::to_string) else {
        // Unreachable in practice: without SNI the resolver finds no
        // certificate and the handshake has already failed.
        debug!(peer = %peer_addr, "connection without SNI");
        return;
    };

    if server_name == admin_domain {
        debug!(peer = %peer_addr, "dispatching admin connection");
        admin_queue.push(tls_stream);
        return;
    }

    route_tunnel_connection(tls_stream, &server_name, peer_addr, registry).await;
}

async fn route_tunnel_connection(
    mut tls_stream: tokio_rustls::server::TlsStream<TcpStream>,
    server_name: &str,
    peer_addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
) {
    let port = match registry.get_port(server_name) {
        Ok(port) => port,
        Err(e) => {
            debug!(peer = %peer_addr, sni = %server_name, "{}", e);
            write_no_tunnel_response(&mut tls_stream, server_name).await;
            return;
        }
    };

    let upstream = match TcpStream::connect(("127.0.0.1", port)).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(sni = %server_name, port = port, "tunnel dial failed: {}", e);
            write_no_tunnel_response(&mut tls_stream, server_name).await;
            return;
        }
    };

    debug!(peer = %peer_addr, sni = %server_name, port = port, "splicing connection");
    let (up, down) = splice(tls_stream, upstream).await;
    debug!(sni = %server_name, bytes_up = up, bytes_down = down, "connection closed");
}

/// Best-effort courtesy for HTTP clients; any other protocol sees garbage
/// followed by close.
async fn write_no_tunnel_response(
    tls_stream: &mut tokio_rustls::server::TlsStream<TcpStream>,
    server_name: &str,
) {
    let body = format!(
        "HTTP/1.1 500 Internal server error\r\n\r\nNo tunnel attached to {}",
        server_name
    );
    let _ = tls_stream.write_all(body.as_bytes()).await;
    let _ = tls_stream.shutdown().await;
}
