//! Per-tunnel worker
//!
//! One worker realises one tunnel: it dials SSH to the edge, requests a
//! remote `tcpip_forward` listener on the tunnel port, and handles every
//! forwarded connection until its cancellation token fires.
//!
//! With server-side TLS termination the forwarded bytes are plaintext and
//! are spliced straight to the local upstream (optionally re-wrapped in
//! TLS when the upstream address carries `https://`). With client-side
//! termination the forwarded bytes are ciphertext: the worker terminates
//! TLS with its own certificate and reverse-proxies HTTP requests to the
//! upstream.

use crate::resolver::DnsResolver;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::decode_secret_key;
use russh::Disconnect;
use rustls::pki_types::ServerName;
use skylift_cert::acme::ACME_TLS_ALPN_PROTOCOL;
use skylift_cert::{CertError, CertManager, CertStore};
use skylift_registry::{TlsTermination, TunnelDescriptor};
use skylift_splice::splice;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("unable to parse tunnel private key: {0}")]
    Key(String),

    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    #[error("SSH authentication failed")]
    AuthFailed,

    #[error("certificate error: {0}")]
    Cert(#[from] CertError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SSH session closed")]
    Disconnected,
}

/// Shared dependencies for every worker this client runs.
pub struct WorkerContext {
    pub certs: Arc<CertManager>,
    pub resolver: Arc<DnsResolver>,
    /// Upstream-facing HTTP client for client-terminated tunnels.
    pub http: reqwest::Client,
}

/// Worker spawner for the supervisor: runs each tunnel as a task and logs
/// its exit. Failures stay contained to the worker; the supervisor starts
/// a replacement on a later reconcile if the tunnel is still desired.
pub fn spawner(
    ctx: Arc<WorkerContext>,
) -> impl Fn(TunnelDescriptor, CancellationToken) + Send + Sync + 'static {
    move |descriptor, cancel| {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let domain = descriptor.domain.clone();
            match run_worker(ctx, descriptor, cancel).await {
                Ok(()) => debug!(domain = %domain, "tunnel worker stopped"),
                Err(e) => warn!(domain = %domain, "tunnel worker failed: {}", e),
            }
        });
    }
}

pub async fn run_worker(
    ctx: Arc<WorkerContext>,
    descriptor: TunnelDescriptor,
    cancel: CancellationToken,
) -> Result<(), WorkerError> {
    let key = decode_secret_key(&descriptor.tunnel_private_key, None)
        .map_err(|e| WorkerError::Key(e.to_string()))?;

    // For client-side termination the certificate must exist before the
    // first connection arrives through the forward.
    let tls = match descriptor.tls_termination {
        TlsTermination::Client => {
            ctx.certs.ensure(&descriptor.domain).await?;
            Some(terminating_acceptor(ctx.certs.resolver()))
        }
        TlsTermination::Server => None,
    };

    let addr = ctx
        .resolver
        .resolve(&descriptor.server_address, descriptor.server_port)
        .await?;

    let config = Arc::new(client::Config {
        nodelay: true,
        ..Default::default()
    });
    let handler = WorkerHandler {
        descriptor: descriptor.clone(),
        ctx: ctx.clone(),
        tls,
    };
    let mut session = client::connect(config, addr, handler).await?;

    let rsa_hash = session.best_supported_rsa_hash().await?.flatten();
    let auth = session
        .authenticate_publickey(
            descriptor.username.clone(),
            PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash),
        )
        .await?;
    if !auth.success() {
        return Err(WorkerError::AuthFailed);
    }

    let bind_addr = descriptor.remote_bind_addr();
    session
        .tcpip_forward(bind_addr.to_string(), descriptor.tunnel_port as u32)
        .await?;
    info!(
        domain = %descriptor.domain,
        bind = %bind_addr,
        port = descriptor.tunnel_port,
        "reverse forward established"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = session
                    .cancel_tcpip_forward(bind_addr.to_string(), descriptor.tunnel_port as u32)
                    .await;
                let _ = session
                    .disconnect(Disconnect::ByApplication, "tunnel removed", "en")
                    .await;
                return Ok(());
            }
            _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {
                if session.is_closed() {
                    return Err(WorkerError::Disconnected);
                }
                let _ = session.send_keepalive(true).await;
            }
        }
    }
}

struct WorkerHandler {
    descriptor: TunnelDescriptor,
    ctx: Arc<WorkerContext>,
    tls: Option<TlsAcceptor>,
}

impl client::Handler for WorkerHandler {
    type Error = russh::Error;

    // Any host key is accepted; see the hardening note in DESIGN.md.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: russh::Channel<client::Msg>,
        _connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let descriptor = self.descriptor.clone();
        let ctx = self.ctx.clone();
        let tls = self.tls.clone();
        // Long-lived copies must not run on the session handler, or the
        // session stops processing packets.
        tokio::spawn(async move {
            let stream = channel.into_stream();
            match tls {
                Some(acceptor) => serve_terminated(acceptor, ctx, descriptor, stream).await,
                None => forward_raw(ctx, descriptor, stream).await,
            }
        });
        Ok(())
    }
}

/// Server-terminated tunnel: splice the (already decrypted) bytes to the
/// local upstream, re-encrypting when the upstream address asks for TLS.
async fn forward_raw(
    ctx: Arc<WorkerContext>,
    descriptor: TunnelDescriptor,
    stream: russh::ChannelStream<client::Msg>,
) {
    let host = descriptor.upstream_host().to_string();
    let addr = match ctx.resolver.resolve(&host, descriptor.client_port).await {
        Ok(addr) => addr,
        Err(e) => {
            warn!(domain = %descriptor.domain, upstream = %host, "upstream resolve failed: {}", e);
            return;
        }
    };

    let upstream = match TcpStream::connect(addr).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(domain = %descriptor.domain, upstream = %addr, "upstream dial failed: {}", e);
            return;
        }
    };

    if descriptor.upstream_uses_tls() {
        let server_name = match ServerName::try_from(host.clone()) {
            Ok(name) => name,
            Err(e) => {
                warn!(upstream = %host, "bad upstream server name: {}", e);
                return;
            }
        };
        match insecure_connector().connect(server_name, upstream).await {
            Ok(tls_upstream) => {
                splice(stream, tls_upstream).await;
            }
            Err(e) => {
                warn!(domain = %descriptor.domain, "upstream TLS handshake failed: {}", e)
            }
        }
    } else {
        splice(stream, upstream).await;
    }
}

/// Client-terminated tunnel: decrypt with our own certificate and forward
/// each HTTP request to the upstream.
async fn serve_terminated(
    acceptor: TlsAcceptor,
    ctx: Arc<WorkerContext>,
    descriptor: TunnelDescriptor,
    stream: russh::ChannelStream<client::Msg>,
) {
    let mut tls_stream = match acceptor.accept(stream).await {
        Ok(tls_stream) => tls_stream,
        Err(e) => {
            debug!(domain = %descriptor.domain, "TLS handshake failed: {}", e);
            return;
        }
    };

    // An acme-tls/1 handshake is a complete challenge response; there is
    // no application data to serve.
    if tls_stream.get_ref().1.alpn_protocol() == Some(ACME_TLS_ALPN_PROTOCOL) {
        let _ = tls_stream.shutdown().await;
        return;
    }

    let service = service_fn(move |request| {
        let http = ctx.http.clone();
        let descriptor = descriptor.clone();
        async move { Ok::<_, Infallible>(proxy_request(http, &descriptor, request).await) }
    });

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
        .await
    {
        debug!("tunnel HTTP connection ended: {}", e);
    }
}

/// Headers that must not cross a proxy hop.
fn is_hop_by_hop(name: &hyper::header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Forward one request to the configured upstream and relay the response.
async fn proxy_request(
    http: reqwest::Client,
    descriptor: &TunnelDescriptor,
    request: hyper::Request<hyper::body::Incoming>,
) -> hyper::Response<Full<Bytes>> {
    let scheme = if descriptor.upstream_uses_tls() {
        "https"
    } else {
        "http"
    };
    let path = request
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    let url = format!(
        "{}://{}:{}{}",
        scheme,
        descriptor.upstream_host(),
        descriptor.client_port,
        path
    );

    let (parts, body) = request.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!("failed to read request body: {}", e);
            return bad_gateway();
        }
    };

    let mut headers = reqwest::header::HeaderMap::new();
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name) && name != hyper::header::HOST {
            headers.insert(name.clone(), value.clone());
        }
    }

    let upstream_response = match http
        .request(parts.method, url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            warn!(domain = %descriptor.domain, "upstream request failed: {}", e);
            return bad_gateway();
        }
    };

    let status = upstream_response.status();
    let mut builder = hyper::Response::builder().status(status);
    if let Some(response_headers) = builder.headers_mut() {
        for (name, value) in upstream_response.headers().iter() {
            if !is_hop_by_hop(name) && name != hyper::header::CONTENT_LENGTH {
                response_headers.insert(name.clone(), value.clone());
            }
        }
    }
    let bytes = upstream_response.bytes().await.unwrap_or_default();
    builder
        .body(Full::new(bytes))
        .unwrap_or_else(|_| bad_gateway())
}

fn bad_gateway() -> hyper::Response<Full<Bytes>> {
    hyper::Response::builder()
        .status(hyper::StatusCode::BAD_GATEWAY)
        .body(Full::new(Bytes::from_static(b"upstream unavailable")))
        .unwrap()
}

/// TLS server config for client-terminated tunnels. The resolver also
/// answers `acme-tls/1`, so validation handshakes arriving through the
/// tunnel complete against the pending challenge certificate.
fn terminating_acceptor(resolver: Arc<CertStore>) -> TlsAcceptor {
    skylift_cert::ensure_crypto_provider();
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![
        b"h2".to_vec(),
        b"http/1.1".to_vec(),
        ACME_TLS_ALPN_PROTOCOL.to_vec(),
    ];
    TlsAcceptor::from(Arc::new(config))
}

/// TLS client for `https://` upstreams. Upstream identity is not verified
/// in this mode; see DESIGN.md.
fn insecure_connector() -> TlsConnector {
    skylift_cert::ensure_crypto_provider();
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(SkipVerification::new())
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_headers_filtered() {
        assert!(is_hop_by_hop(&hyper::header::CONNECTION));
        assert!(is_hop_by_hop(&hyper::header::TRANSFER_ENCODING));
        assert!(!is_hop_by_hop(&hyper::header::CONTENT_TYPE));
        assert!(!is_hop_by_hop(&hyper::header::ACCEPT));
    }

    #[test]
    fn test_bad_key_material_is_a_worker_error() {
        let err = decode_secret_key("not a key", None);
        assert!(err.is_err());
    }
}
