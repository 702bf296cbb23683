//! skylift client binary

use anyhow::Context;
use clap::Parser;
use skylift_cert::acme::{AcmeConfig, ChallengeMode};
use skylift_cert::{serve_alpn_challenges, AcmeClient, CertManager, CertStorage, CertStore};
use skylift_client::resolver::ReqwestDns;
use skylift_client::{worker, ApiClient, DnsResolver, Poller, TunnelSupervisor, WorkerContext};
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Expose local services through a skylift server
#[derive(Parser, Debug)]
#[command(name = "skylift-client")]
#[command(about = "Maintain reverse SSH tunnels advertised by a skylift server", long_about = None)]
struct Cli {
    /// skylift server to poll (hostname, optionally host:port)
    #[arg(long)]
    server: String,

    /// Access token
    #[arg(long, env = "SKYLIFT_TOKEN")]
    token: String,

    /// Client name; selects which tunnels this client realises
    #[arg(long)]
    client_name: String,

    /// User owning the client registration
    #[arg(long, default_value = "admin")]
    user: String,

    /// TLS certificate storage directory
    #[arg(long, default_value = "./certs")]
    cert_dir: PathBuf,

    /// Email for ACME (ie Let's Encrypt)
    #[arg(long)]
    acme_email: Option<String>,

    /// Resolve all names through this DNS server (UDP port 53)
    #[arg(long)]
    dns_server: Option<IpAddr>,

    /// Use the ACME staging environment
    #[arg(long)]
    acme_staging: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let resolver = Arc::new(match cli.dns_server {
        Some(dns_server) => {
            info!(dns_server = %dns_server, "using custom DNS server");
            DnsResolver::custom(dns_server)
        }
        None => DnsResolver::system(),
    });

    // Certificate manager for client-terminated tunnels. HTTP-01 is
    // unusable here (no port 80 on a NAT-ed machine); TLS-ALPN-01 answers
    // on a randomly chosen unprivileged port and through the tunnels
    // themselves.
    let store = Arc::new(CertStore::new());
    let storage = CertStorage::new(&cli.cert_dir);
    storage.init().await.context("creating certificate directory")?;
    let acme = AcmeClient::new(
        AcmeConfig {
            contact_email: cli
                .acme_email
                .clone()
                .unwrap_or_else(|| format!("{}@{}", cli.user, cli.server)),
            use_staging: cli.acme_staging,
            mode: ChallengeMode::TlsAlpn01 {
                challenges: store.challenges(),
            },
        },
        storage.clone(),
    );
    let certs = Arc::new(CertManager::new(store.clone(), storage, acme));

    let challenge_listener = TcpListener::bind("0.0.0.0:0")
        .await
        .context("binding tls-alpn-01 challenge listener")?;
    let challenge_store = store.clone();
    tokio::spawn(async move {
        if let Err(e) = serve_alpn_challenges(challenge_listener, challenge_store).await {
            error!("tls-alpn-01 challenge listener failed: {}", e);
        }
    });

    // Two HTTP clients: the poller verifies the server's certificate, the
    // upstream forwarder does not verify upstream identity.
    let poll_http = reqwest::Client::builder()
        .dns_resolver(Arc::new(ReqwestDns(resolver.clone())))
        .build()
        .context("building HTTP client")?;
    let upstream_http = reqwest::Client::builder()
        .dns_resolver(Arc::new(ReqwestDns(resolver.clone())))
        .danger_accept_invalid_certs(true)
        .build()
        .context("building upstream HTTP client")?;

    let ctx = Arc::new(WorkerContext {
        certs,
        resolver,
        http: upstream_http,
    });
    let supervisor = Arc::new(TunnelSupervisor::new(worker::spawner(ctx)));

    let api = ApiClient::new(poll_http, cli.server.clone(), cli.token.clone());
    api.register_client(&cli.user, &cli.client_name)
        .await
        .context("registering client with server")?;

    let poller = Poller::new(api, cli.client_name.clone(), supervisor.clone());
    info!(server = %cli.server, client = %cli.client_name, "client running");

    tokio::select! {
        _ = poller.run() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            supervisor.shutdown();
        }
    }
    Ok(())
}
