//! SNI certificate resolver cache
//!
//! The resolver runs inside the TLS handshake, so lookups must be
//! non-blocking cache hits. Provisioning never happens here; the manager
//! installs certificates after `ensure()` completes.

use crate::acme::{AlpnChallenges, ACME_TLS_ALPN_PROTOCOL};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, trace};

/// In-memory certificate cache keyed by hostname, usable as a rustls
/// server certificate resolver.
///
/// There is no default certificate: a ClientHello without SNI, or with a
/// name nothing was provisioned for, fails the handshake.
#[derive(Debug)]
pub struct CertStore {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    /// Pending TLS-ALPN-01 challenge certificates, consulted before the
    /// regular cache when the hello negotiates `acme-tls/1`.
    challenges: Arc<AlpnChallenges>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::with_challenges(Arc::new(AlpnChallenges::new()))
    }

    pub fn with_challenges(challenges: Arc<AlpnChallenges>) -> Self {
        Self {
            certs: RwLock::new(HashMap::new()),
            challenges,
        }
    }

    pub fn insert(&self, domain: String, cert: Arc<CertifiedKey>) {
        debug!(domain = %domain, "installing certificate");
        self.certs.write().unwrap().insert(domain, cert);
    }

    pub fn remove(&self, domain: &str) -> bool {
        self.certs.write().unwrap().remove(domain).is_some()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.certs.read().unwrap().contains_key(domain)
    }

    pub fn get(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.read().unwrap().get(domain).cloned()
    }

    pub fn len(&self) -> usize {
        self.certs.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn challenges(&self) -> Arc<AlpnChallenges> {
        self.challenges.clone()
    }
}

impl Default for CertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ResolvesServerCert for CertStore {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name()?.to_string();

        let is_acme_alpn = client_hello
            .alpn()
            .map(|mut protos| protos.any(|p| p == ACME_TLS_ALPN_PROTOCOL))
            .unwrap_or(false);
        if is_acme_alpn {
            trace!(domain = %name, "resolving acme-tls/1 challenge certificate");
            return self.challenges.get(&name);
        }

        self.certs.read().unwrap().get(&name).cloned()
    }
}
