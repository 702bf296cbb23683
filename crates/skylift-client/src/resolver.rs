//! Name resolution with an optional DNS server override
//!
//! `--dns-server` replaces the system resolver with a single UDP:53
//! nameserver for every outbound resolution in the process: the poll
//! requests, the SSH dials, and the upstream forwards all route through
//! the same resolver handle.

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

pub struct DnsResolver {
    /// `None` means the system resolver.
    custom: Option<TokioAsyncResolver>,
}

impl DnsResolver {
    /// System resolver (getaddrinfo through tokio).
    pub fn system() -> Self {
        Self { custom: None }
    }

    /// Resolve everything through `dns_server` on UDP port 53.
    pub fn custom(dns_server: IpAddr) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(
            SocketAddr::new(dns_server, 53),
            Protocol::Udp,
        ));
        let resolver = TokioAsyncResolver::tokio(config, ResolverOpts::default());
        Self {
            custom: Some(resolver),
        }
    }

    /// Resolve `host` to a socket address. IP literals short-circuit.
    pub async fn resolve(&self, host: &str, port: u16) -> std::io::Result<SocketAddr> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, port));
        }

        match &self.custom {
            Some(resolver) => {
                let lookup = resolver.lookup_ip(host).await.map_err(|e| {
                    std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string())
                })?;
                let ip = lookup.iter().next().ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", host),
                    )
                })?;
                Ok(SocketAddr::new(ip, port))
            }
            None => tokio::net::lookup_host((host, port))
                .await?
                .next()
                .ok_or_else(|| {
                    std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("no addresses found for {}", host),
                    )
                }),
        }
    }
}

/// Adapter so reqwest resolves through the same handle.
pub struct ReqwestDns(pub Arc<DnsResolver>);

impl reqwest::dns::Resolve for ReqwestDns {
    fn resolve(&self, name: reqwest::dns::Name) -> reqwest::dns::Resolving {
        let resolver = self.0.clone();
        Box::pin(async move {
            let addr = resolver
                .resolve(name.as_str(), 0)
                .await
                .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)?;
            let addrs: Box<dyn Iterator<Item = SocketAddr> + Send> = Box::new(std::iter::once(addr));
            Ok(addrs)
        })
    }
}
