//! ACME client for automatic certificate provisioning
//!
//! Supports three validation modes, selected per process:
//!
//! - HTTP-01: the key authorization is published in a shared table the
//!   edge serves at `/.well-known/acme-challenge/{token}` on port 80.
//! - DNS-01: the TXT record content is published in a table for an
//!   external automation to install at `_acme-challenge.{domain}`.
//! - TLS-ALPN-01: a challenge certificate carrying the ACME identifier
//!   extension is installed for the `acme-tls/1` protocol. Used on the
//!   client side, where the router does not own port 443 and the challenge
//!   handshake arrives either through the tunnel or on a randomly chosen
//!   unprivileged local port.

use crate::storage::{CertStorage, StoredCertificate};
use crate::{certified_key_from_der, CertError};
use chrono::Utc;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus, RetryPolicy,
};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// ALPN protocol id for the TLS-ALPN-01 challenge.
pub const ACME_TLS_ALPN_PROTOCOL: &[u8] = b"acme-tls/1";

/// Certificates issued by Let's Encrypt are valid for 90 days; the order
/// metadata does not carry the expiry, so it is recorded at issuance.
const ISSUED_VALIDITY_DAYS: i64 = 90;

/// Outstanding HTTP-01 key authorizations, keyed by token.
#[derive(Debug, Default)]
pub struct Http01Responses {
    responses: Mutex<HashMap<String, String>>,
}

impl Http01Responses {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: String, key_authorization: String) {
        self.responses.lock().unwrap().insert(token, key_authorization);
    }

    /// Key authorization for a token, as served at
    /// `/.well-known/acme-challenge/{token}`.
    pub fn get(&self, token: &str) -> Option<String> {
        self.responses.lock().unwrap().get(token).cloned()
    }

    pub fn remove(&self, token: &str) {
        self.responses.lock().unwrap().remove(token);
    }
}

/// Outstanding DNS-01 TXT record values, keyed by record name.
#[derive(Debug, Default)]
pub struct Dns01Records {
    records: Mutex<HashMap<String, String>>,
}

impl Dns01Records {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record_name: String, value: String) {
        self.records.lock().unwrap().insert(record_name, value);
    }

    pub fn get(&self, record_name: &str) -> Option<String> {
        self.records.lock().unwrap().get(record_name).cloned()
    }

    pub fn remove(&self, record_name: &str) {
        self.records.lock().unwrap().remove(record_name);
    }
}

/// Pending TLS-ALPN-01 challenge certificates, keyed by domain.
#[derive(Debug, Default)]
pub struct AlpnChallenges {
    certs: Mutex<HashMap<String, Arc<CertifiedKey>>>,
}

impl AlpnChallenges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, domain: String, cert: Arc<CertifiedKey>) {
        self.certs.lock().unwrap().insert(domain, cert);
    }

    pub fn get(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.lock().unwrap().get(domain).cloned()
    }

    pub fn remove(&self, domain: &str) {
        self.certs.lock().unwrap().remove(domain);
    }
}

/// How this process answers ACME validation.
#[derive(Clone)]
pub enum ChallengeMode {
    /// Serve key authorizations over plain HTTP on port 80. The router
    /// owns 443, so TLS-ALPN-01 is unusable on the server.
    Http01 { responses: Arc<Http01Responses> },
    /// Publish TXT record values for out-of-band DNS automation.
    Dns01 { records: Arc<Dns01Records> },
    /// Answer `acme-tls/1` handshakes with a challenge certificate.
    TlsAlpn01 { challenges: Arc<AlpnChallenges> },
}

impl std::fmt::Debug for ChallengeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChallengeMode::Http01 { .. } => f.write_str("http-01"),
            ChallengeMode::Dns01 { .. } => f.write_str("dns-01"),
            ChallengeMode::TlsAlpn01 { .. } => f.write_str("tls-alpn-01"),
        }
    }
}

/// ACME client configuration
#[derive(Debug, Clone)]
pub struct AcmeConfig {
    /// Contact email for the ACME account.
    pub contact_email: String,
    /// Use the staging directory (for testing).
    pub use_staging: bool,
    pub mode: ChallengeMode,
}

/// ACME client: account management plus the order/challenge/finalize flow.
pub struct AcmeClient {
    config: AcmeConfig,
    storage: CertStorage,
    account: RwLock<Option<Arc<Account>>>,
}

impl AcmeClient {
    pub fn new(config: AcmeConfig, storage: CertStorage) -> Self {
        Self {
            config,
            storage,
            account: RwLock::new(None),
        }
    }

    /// Load the account from disk or register a new one, caching it.
    async fn account(&self) -> Result<Arc<Account>, CertError> {
        if let Some(account) = self.account.read().await.as_ref() {
            return Ok(account.clone());
        }

        let account_path = self.storage.account_path();
        let account = if let Ok(creds_json) = fs::read_to_string(&account_path).await {
            let creds: AccountCredentials = serde_json::from_str(&creds_json)
                .map_err(|e| CertError::Account(format!("bad account credentials: {}", e)))?;
            let account = Account::builder()
                .map_err(|e| CertError::Account(e.to_string()))?
                .from_credentials(creds)
                .await
                .map_err(|e| CertError::Account(e.to_string()))?;
            info!(path = %account_path.display(), "ACME account loaded");
            account
        } else {
            let directory_url = if self.config.use_staging {
                LetsEncrypt::Staging.url().to_string()
            } else {
                LetsEncrypt::Production.url().to_string()
            };
            let contact = format!("mailto:{}", self.config.contact_email);
            let (account, creds) = Account::builder()
                .map_err(|e| CertError::Account(e.to_string()))?
                .create(
                    &NewAccount {
                        contact: &[&contact],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    directory_url,
                    None,
                )
                .await
                .map_err(|e| CertError::Account(e.to_string()))?;

            self.storage.init().await?;
            let creds_json = serde_json::to_string_pretty(&creds)
                .map_err(|e| CertError::Account(format!("failed to encode credentials: {}", e)))?;
            fs::write(&account_path, creds_json).await?;
            info!(path = %account_path.display(), "ACME account created");
            account
        };

        let account = Arc::new(account);
        *self.account.write().await = Some(account.clone());
        Ok(account)
    }

    /// Run a complete order for `domain` and return the issued certificate.
    ///
    /// Publishes the challenge response for the configured mode, tells the
    /// CA it is ready, and polls the order to completion.
    pub async fn obtain(&self, domain: &str) -> Result<StoredCertificate, CertError> {
        let account = self.account().await?;

        info!(domain = %domain, mode = ?self.config.mode, "requesting certificate");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| CertError::Order {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        let mut authorizations = order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result.map_err(|e| CertError::Order {
                domain: domain.to_string(),
                reason: format!("authorization unavailable: {}", e),
            })?;
            match authz.status {
                AuthorizationStatus::Valid => continue,
                AuthorizationStatus::Pending => {}
                other => {
                    return Err(CertError::Challenge {
                        domain: domain.to_string(),
                        reason: format!("authorization status {:?}", other),
                    })
                }
            }
            let challenge_type = match &self.config.mode {
                ChallengeMode::Http01 { .. } => ChallengeType::Http01,
                ChallengeMode::Dns01 { .. } => ChallengeType::Dns01,
                ChallengeMode::TlsAlpn01 { .. } => ChallengeType::TlsAlpn01,
            };
            let mut challenge =
                authz
                    .challenge(challenge_type)
                    .ok_or_else(|| CertError::Challenge {
                        domain: domain.to_string(),
                        reason: format!("{:?} not offered by the CA", self.config.mode),
                    })?;

            let key_auth = challenge.key_authorization();
            match &self.config.mode {
                ChallengeMode::Http01 { responses } => {
                    debug!(domain = %domain, token = %challenge.token, "publishing http-01 response");
                    responses.insert(challenge.token.clone(), key_auth.as_str().to_string());
                }
                ChallengeMode::Dns01 { records } => {
                    let record_name =
                        format!("_acme-challenge.{}", domain.trim_start_matches("*."));
                    debug!(domain = %domain, record = %record_name, "publishing dns-01 record value");
                    records.insert(record_name, key_auth.dns_value());
                }
                ChallengeMode::TlsAlpn01 { challenges } => {
                    let digest = Sha256::digest(key_auth.as_str().as_bytes());
                    let cert = alpn_challenge_cert(domain, digest.as_slice())?;
                    debug!(domain = %domain, "installing acme-tls/1 challenge certificate");
                    challenges.insert(domain.to_string(), cert);
                }
            }

            challenge.set_ready().await.map_err(|e| CertError::Challenge {
                domain: domain.to_string(),
                reason: format!("failed to signal readiness: {}", e),
            })?;
        }
        drop(authorizations);

        let retry_policy = RetryPolicy::new()
            .timeout(Duration::from_secs(120))
            .initial_delay(Duration::from_secs(2));

        let status = order.poll_ready(&retry_policy).await.map_err(|e| {
            self.clear_challenge(domain);
            CertError::Challenge {
                domain: domain.to_string(),
                reason: format!("validation did not complete: {}", e),
            }
        })?;
        self.clear_challenge(domain);

        if status != OrderStatus::Ready {
            return Err(CertError::Challenge {
                domain: domain.to_string(),
                reason: format!("order status {:?} after validation", status),
            });
        }

        let private_key_pem = order.finalize().await.map_err(|e| CertError::Order {
            domain: domain.to_string(),
            reason: format!("finalize failed: {}", e),
        })?;
        let certificate_pem =
            order
                .poll_certificate(&retry_policy)
                .await
                .map_err(|e| CertError::Order {
                    domain: domain.to_string(),
                    reason: format!("certificate unavailable: {}", e),
                })?;

        let now = Utc::now();
        let cert = StoredCertificate {
            domain: domain.to_string(),
            certificate_pem,
            private_key_pem,
            expires_at: now + chrono::Duration::days(ISSUED_VALIDITY_DAYS),
            created_at: now,
        };
        info!(domain = %domain, expires_at = %cert.expires_at, "certificate issued");
        Ok(cert)
    }

    /// Drop any published challenge material for `domain`.
    fn clear_challenge(&self, domain: &str) {
        match &self.config.mode {
            // HTTP-01 responses are keyed by token, not domain; the next
            // order replaces them.
            ChallengeMode::Http01 { .. } => {}
            ChallengeMode::Dns01 { records } => {
                records.remove(&format!("_acme-challenge.{}", domain.trim_start_matches("*.")));
            }
            ChallengeMode::TlsAlpn01 { challenges } => challenges.remove(domain),
        }
    }
}

/// Answer `acme-tls/1` validation handshakes on a dedicated listener.
///
/// Used where the public TLS port belongs to someone else: the listener is
/// bound to a randomly chosen unprivileged port and the ACME account is
/// configured to validate against it. The handshake itself is the whole
/// challenge response, so connections are closed right after it completes.
pub async fn serve_alpn_challenges(
    listener: tokio::net::TcpListener,
    store: Arc<crate::CertStore>,
) -> std::io::Result<()> {
    crate::ensure_crypto_provider();
    let mut tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(store);
    tls_config.alpn_protocols = vec![ACME_TLS_ALPN_PROTOCOL.to_vec()];
    let acceptor = tokio_rustls::TlsAcceptor::from(Arc::new(tls_config));

    info!(addr = %listener.local_addr()?, "tls-alpn-01 challenge listener ready");
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!("challenge listener accept error: {}", e);
                continue;
            }
        };
        let acceptor = acceptor.clone();
        tokio::spawn(async move {
            match acceptor.accept(stream).await {
                Ok(mut tls_stream) => {
                    use tokio::io::AsyncWriteExt;
                    let _ = tls_stream.shutdown().await;
                }
                Err(e) => debug!("challenge handshake failed: {}", e),
            }
        });
    }
}

/// Self-signed certificate for the TLS-ALPN-01 handshake: single SAN for
/// the domain plus the critical ACME identifier extension carrying the
/// SHA-256 of the key authorization.
fn alpn_challenge_cert(domain: &str, digest: &[u8]) -> Result<Arc<CertifiedKey>, CertError> {
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| CertError::Parse(format!("challenge cert params: {}", e)))?;
    params.custom_extensions = vec![rcgen::CustomExtension::new_acme_identifier(digest)];

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| CertError::Parse(format!("keygen: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Parse(format!("challenge cert: {}", e)))?;

    certified_key_from_der(
        cert.der().clone(),
        rustls::pki_types::PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| CertError::Parse(format!("challenge key: {:?}", e)))?,
    )
}
