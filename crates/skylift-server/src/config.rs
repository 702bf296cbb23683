//! Server configuration file

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// SMTP settings for the login magic-link mail. Parsed for compatibility;
/// delivery itself happens behind [`crate::auth::LoginNotifier`].
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub server: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Top-level server configuration, loaded once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Hostname of the admin control plane. Connections whose SNI equals
    /// this name are routed to the admin HTTP server.
    pub admin_domain: String,
    #[serde(default)]
    pub smtp: Option<SmtpConfig>,

    /// Public TLS endpoint.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: SocketAddr,
    /// Plain-HTTP endpoint for ACME HTTP-01 challenges.
    #[serde(default = "default_http_bind_addr")]
    pub http_bind_addr: SocketAddr,
    /// Certificate storage directory.
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    /// Contact email for the ACME account.
    #[serde(default)]
    pub acme_email: Option<String>,
    /// Use the ACME staging directory.
    #[serde(default)]
    pub acme_staging: bool,
    /// Bearer tokens that are authorized without the login flow, for
    /// headless clients.
    #[serde(default)]
    pub api_tokens: Vec<String>,
}

fn default_bind_addr() -> SocketAddr {
    "0.0.0.0:443".parse().unwrap()
}

fn default_http_bind_addr() -> SocketAddr {
    "0.0.0.0:80".parse().unwrap()
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("./certs")
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}
