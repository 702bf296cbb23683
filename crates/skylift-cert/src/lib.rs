//! Certificate management with ACME support
//!
//! Obtains certificates from an ACME CA on first use, persists them to a
//! storage directory, renews them before expiry, and answers SNI lookups
//! from an in-memory resolver cache during TLS handshakes.

pub mod acme;
pub mod manager;
pub mod storage;
pub mod store;

pub use acme::{
    serve_alpn_challenges, AcmeClient, AcmeConfig, AlpnChallenges, ChallengeMode, Dns01Records,
    Http01Responses,
};
pub use manager::CertManager;
pub use storage::{CertStorage, StoredCertificate};
pub use store::CertStore;

use rustls::crypto::ring::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use std::sync::Arc;
use thiserror::Error;

/// Certificate manager errors
#[derive(Debug, Error)]
pub enum CertError {
    #[error("ACME account error: {0}")]
    Account(String),

    #[error("ACME order failed for {domain}: {reason}")]
    Order { domain: String, reason: String },

    #[error("challenge could not be completed for {domain}: {reason}")]
    Challenge { domain: String, reason: String },

    #[error("no certificate available for {0}")]
    NotFound(String),

    #[error("failed to parse certificate material: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring crypto provider once, process-wide. Safe to call from
/// every code path that builds a rustls config.
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("rustls crypto provider already installed");
        }
    });
}

/// Build a rustls `CertifiedKey` from PEM-encoded chain and private key.
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> Result<CertifiedKey, CertError> {
    ensure_crypto_provider();
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| CertError::Parse(format!("bad certificate chain: {}", e)))?;
    if chain.is_empty() {
        return Err(CertError::Parse("certificate chain is empty".to_string()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_bytes())
        .map_err(|e| CertError::Parse(format!("bad private key: {}", e)))?
        .ok_or_else(|| CertError::Parse("no private key found".to_string()))?;

    let signing_key = any_supported_type(&key)
        .map_err(|e| CertError::Parse(format!("unsupported key type: {}", e)))?;

    Ok(CertifiedKey::new(chain, signing_key))
}

/// Build a `CertifiedKey` from DER parts (used for challenge certificates).
pub fn certified_key_from_der(
    cert: CertificateDer<'static>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<CertifiedKey>, CertError> {
    ensure_crypto_provider();
    let signing_key = any_supported_type(&key)
        .map_err(|e| CertError::Parse(format!("unsupported key type: {}", e)))?;
    Ok(Arc::new(CertifiedKey::new(vec![cert], signing_key)))
}
