//! Tunnel descriptor model

use serde::{Deserialize, Serialize};

/// Where TLS for a tunnel is terminated.
///
/// With `Server` termination the edge decrypts and forwards plaintext over
/// the reverse tunnel. With `Client` termination the edge forwards
/// ciphertext and the client decrypts next to the upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsTermination {
    Server,
    Client,
}

/// The record describing one published hostname and how to reach its
/// upstream.
///
/// `domain` is the primary key; two descriptors with the same domain but
/// any differing field are distinct tunnels as far as clients are
/// concerned (the old worker is torn down before the new one starts).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelDescriptor {
    /// Public hostname; the SNI value clients connect with.
    pub domain: String,
    /// Host the tunnel client dials SSH to.
    pub server_address: String,
    /// Port the tunnel client dials SSH to.
    pub server_port: u16,
    /// SSH user for the reverse tunnel.
    pub username: String,
    /// Client identity this tunnel belongs to; drives the poll filter.
    pub client_name: String,
    /// Private key material the client authenticates the SSH session with.
    pub tunnel_private_key: String,
    /// Server-side port where the reverse forward listens.
    pub tunnel_port: u16,
    /// Upstream host the client forwards traffic to. A `https://` prefix
    /// means the client dials the upstream over TLS.
    pub client_address: String,
    /// Upstream port.
    pub client_port: u16,
    /// Bind the server-side listener on all interfaces instead of loopback.
    #[serde(default)]
    pub allow_external_tcp: bool,
    pub tls_termination: TlsTermination,
}

impl TunnelDescriptor {
    /// True when the upstream address carries a `https://` scheme prefix,
    /// i.e. the client must dial the upstream over TLS.
    pub fn upstream_uses_tls(&self) -> bool {
        self.client_address.starts_with("https://")
    }

    /// Upstream host with any scheme prefix stripped.
    pub fn upstream_host(&self) -> &str {
        self.client_address
            .strip_prefix("https://")
            .unwrap_or(&self.client_address)
    }

    /// `host:port` the client dials for this tunnel's upstream.
    pub fn upstream_addr(&self) -> String {
        format!("{}:{}", self.upstream_host(), self.client_port)
    }

    /// Address the server-side reverse listener binds to.
    pub fn remote_bind_addr(&self) -> &'static str {
        if self.allow_external_tcp {
            "0.0.0.0"
        } else {
            "127.0.0.1"
        }
    }
}
