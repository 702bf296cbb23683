//! Certificate manager
//!
//! Ties the resolver cache, the filesystem storage, and the ACME client
//! together. `ensure()` is the blocking entry point callers use before a
//! hostname must be servable; the resolver itself never provisions.

use crate::acme::AcmeClient;
use crate::storage::CertStorage;
use crate::store::CertStore;
use crate::{certified_key_from_pem, CertError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct CertManager {
    store: Arc<CertStore>,
    storage: CertStorage,
    acme: AcmeClient,
    /// Serialises provisioning so concurrent `ensure` calls for the same
    /// hostname issue a single order.
    provision: Mutex<()>,
}

impl CertManager {
    pub fn new(store: Arc<CertStore>, storage: CertStorage, acme: AcmeClient) -> Self {
        Self {
            store,
            storage,
            acme,
            provision: Mutex::new(()),
        }
    }

    /// Read-only resolver handle for TLS server configs.
    pub fn resolver(&self) -> Arc<CertStore> {
        self.store.clone()
    }

    /// Make sure a usable certificate for `hostname` is installed in the
    /// resolver, obtaining one via ACME if neither the cache nor the
    /// storage directory has it. Blocks until provisioning completes.
    pub async fn ensure(&self, hostname: &str) -> Result<(), CertError> {
        if self.store.contains(hostname) {
            return Ok(());
        }

        let _guard = self.provision.lock().await;
        // A concurrent ensure may have installed it while we waited.
        if self.store.contains(hostname) {
            return Ok(());
        }

        match self.storage.load(hostname).await {
            Ok(cert) if !cert.needs_renewal() => {
                debug!(domain = %hostname, "certificate loaded from storage");
                let key = certified_key_from_pem(&cert.certificate_pem, &cert.private_key_pem)?;
                self.store.insert(hostname.to_string(), Arc::new(key));
                return Ok(());
            }
            Ok(_) => debug!(domain = %hostname, "stored certificate due for renewal"),
            Err(CertError::NotFound(_)) => debug!(domain = %hostname, "no stored certificate"),
            Err(e) => return Err(e),
        }

        let cert = self.acme.obtain(hostname).await?;
        self.storage.store(&cert).await?;
        let key = certified_key_from_pem(&cert.certificate_pem, &cert.private_key_pem)?;
        self.store.insert(hostname.to_string(), Arc::new(key));
        Ok(())
    }

    /// Renew every stored certificate inside its renewal window. Returns
    /// the number renewed; individual failures are logged and skipped so
    /// one broken domain does not starve the rest.
    pub async fn renew_due(&self) -> Result<usize, CertError> {
        let mut renewed = 0;
        for domain in self.storage.list_domains().await? {
            let due = match self.storage.load(&domain).await {
                Ok(cert) => cert.needs_renewal(),
                Err(e) => {
                    warn!(domain = %domain, "skipping unreadable certificate: {}", e);
                    continue;
                }
            };
            if !due {
                continue;
            }

            let _guard = self.provision.lock().await;
            match self.acme.obtain(&domain).await {
                Ok(cert) => {
                    self.storage.store(&cert).await?;
                    match certified_key_from_pem(&cert.certificate_pem, &cert.private_key_pem) {
                        Ok(key) => self.store.insert(domain.clone(), Arc::new(key)),
                        Err(e) => {
                            warn!(domain = %domain, "renewed certificate unusable: {}", e);
                            continue;
                        }
                    }
                    info!(domain = %domain, "certificate renewed");
                    renewed += 1;
                }
                Err(e) => warn!(domain = %domain, "renewal failed: {}", e),
            }
        }
        Ok(renewed)
    }

    /// Background renewal sweep, once a day. Expiring certificates are
    /// replaced without operator action.
    pub fn spawn_renewal_task(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                interval.tick().await;
                if let Err(e) = self.renew_due().await {
                    warn!("renewal sweep failed: {}", e);
                }
            }
        })
    }
}
