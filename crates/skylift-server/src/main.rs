//! skylift server binary

use anyhow::Context;
use clap::Parser;
use skylift_cert::acme::{AcmeConfig, ChallengeMode};
use skylift_cert::{AcmeClient, CertManager, CertStorage, CertStore, Http01Responses};
use skylift_registry::TunnelRegistry;
use skylift_server::{
    admin_router, challenge, AdminListener, AdminState, Auth, ConnectionRouter, LogNotifier,
    ServerConfig,
};
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Public edge reverse proxy for SSH-tunneled upstreams
#[derive(Parser, Debug)]
#[command(name = "skylift-server")]
#[command(about = "Multiplex virtual hosts onto one TLS endpoint", long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short, long, default_value = "skylift_config.json")]
    config: String,

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

    let config = ServerConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config))?;
    info!(admin_domain = %config.admin_domain, "starting skylift server");

    // Certificate manager: HTTP-01 over port 80, since the router owns 443.
    let http01_responses = Arc::new(Http01Responses::new());
    let storage = CertStorage::new(&config.cert_dir);
    storage.init().await.context("creating certificate directory")?;
    let acme = AcmeClient::new(
        AcmeConfig {
            contact_email: config
                .acme_email
                .clone()
                .unwrap_or_else(|| format!("admin@{}", config.admin_domain)),
            use_staging: config.acme_staging,
            mode: ChallengeMode::Http01 {
                responses: http01_responses.clone(),
            },
        },
        storage.clone(),
    );
    let store = Arc::new(CertStore::new());
    let certs = Arc::new(CertManager::new(store.clone(), storage, acme));

    let challenge_listener = TcpListener::bind(config.http_bind_addr)
        .await
        .with_context(|| format!("binding http-01 listener on {}", config.http_bind_addr))?;
    tokio::spawn(async move {
        if let Err(e) = challenge::serve_http01(challenge_listener, http01_responses).await {
            error!("http-01 challenge listener failed: {}", e);
        }
    });

    // A missing admin certificate is not fatal; the edge still comes up.
    if let Err(e) = certs.ensure(&config.admin_domain).await {
        warn!(domain = %config.admin_domain, "admin certificate unavailable: {}", e);
    }
    certs.clone().spawn_renewal_task();

    let registry = Arc::new(TunnelRegistry::new());
    let auth = Arc::new(Auth::new(config.admin_domain.clone(), Box::new(LogNotifier)));
    for token in &config.api_tokens {
        auth.grant(token.clone());
    }

    let (admin_queue, admin_listener) = AdminListener::new(64);
    let admin_state = Arc::new(AdminState::new(registry.clone(), auth, certs));
    tokio::spawn(admin_listener.serve(admin_router(admin_state)));

    let router = ConnectionRouter::new(
        config.bind_addr,
        config.admin_domain,
        registry,
        store,
        admin_queue,
    );
    router.run().await.context("connection router failed")?;
    Ok(())
}
