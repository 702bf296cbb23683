//! Filesystem certificate storage
//!
//! Layout under the storage directory: `<domain>.crt` / `<domain>.key`
//! (PEM) plus `<domain>.json` with renewal metadata, and `account.json`
//! for the ACME account credentials.

use crate::CertError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// A persisted certificate with renewal metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCertificate {
    pub domain: String,
    pub certificate_pem: String,
    pub private_key_pem: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl StoredCertificate {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Renewal is due inside the last 30 days of validity.
    pub fn needs_renewal(&self) -> bool {
        Utc::now() > self.expires_at - chrono::Duration::days(30)
    }
}

/// Metadata sidecar persisted next to the PEM files.
#[derive(Debug, Serialize, Deserialize)]
struct CertMeta {
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
}

/// Pluggable-by-directory certificate storage (the default backend).
#[derive(Debug, Clone)]
pub struct CertStorage {
    dir: PathBuf,
}

impl CertStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn account_path(&self) -> PathBuf {
        self.dir.join("account.json")
    }

    fn cert_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{}.crt", domain))
    }

    fn key_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{}.key", domain))
    }

    fn meta_path(&self, domain: &str) -> PathBuf {
        self.dir.join(format!("{}.json", domain))
    }

    pub async fn init(&self) -> Result<(), CertError> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub async fn store(&self, cert: &StoredCertificate) -> Result<(), CertError> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.cert_path(&cert.domain), &cert.certificate_pem).await?;
        fs::write(self.key_path(&cert.domain), &cert.private_key_pem).await?;
        let meta = CertMeta {
            expires_at: cert.expires_at,
            created_at: cert.created_at,
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| CertError::Parse(format!("failed to encode metadata: {}", e)))?;
        fs::write(self.meta_path(&cert.domain), meta_json).await?;
        debug!(domain = %cert.domain, dir = %self.dir.display(), "certificate persisted");
        Ok(())
    }

    /// Load a certificate from disk. Returns `NotFound` when the PEM files
    /// are absent. Missing metadata is treated as already due for renewal
    /// so a fresh order replaces it.
    pub async fn load(&self, domain: &str) -> Result<StoredCertificate, CertError> {
        let cert_pem = match fs::read_to_string(self.cert_path(domain)).await {
            Ok(pem) => pem,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CertError::NotFound(domain.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let key_pem = fs::read_to_string(self.key_path(domain)).await?;

        let meta = match fs::read_to_string(self.meta_path(domain)).await {
            Ok(json) => serde_json::from_str::<CertMeta>(&json)
                .map_err(|e| CertError::Parse(format!("bad metadata for {}: {}", domain, e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CertMeta {
                expires_at: Utc::now(),
                created_at: Utc::now(),
            },
            Err(e) => return Err(e.into()),
        };

        Ok(StoredCertificate {
            domain: domain.to_string(),
            certificate_pem: cert_pem,
            private_key_pem: key_pem,
            expires_at: meta.expires_at,
            created_at: meta.created_at,
        })
    }

    pub async fn exists(&self, domain: &str) -> bool {
        fs::metadata(self.cert_path(domain)).await.is_ok()
            && fs::metadata(self.key_path(domain)).await.is_ok()
    }

    /// Domains with persisted certificates.
    pub async fn list_domains(&self) -> Result<Vec<String>, CertError> {
        let mut domains = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(domains),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(domain) = name.strip_suffix(".crt") {
                domains.push(domain.to_string());
            }
        }
        Ok(domains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(domain: &str, days: i64) -> StoredCertificate {
        StoredCertificate {
            domain: domain.to_string(),
            certificate_pem: "CERT".to_string(),
            private_key_pem: "KEY".to_string(),
            expires_at: Utc::now() + chrono::Duration::days(days),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_renewal_threshold() {
        assert!(stored("a.example.com", 20).needs_renewal());
        assert!(!stored("a.example.com", 60).needs_renewal());
        assert!(stored("a.example.com", -1).is_expired());
        assert!(!stored("a.example.com", 1).is_expired());
    }

    #[tokio::test]
    async fn test_store_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::new(dir.path());

        let cert = stored("app.example.com", 90);
        storage.store(&cert).await.unwrap();

        let loaded = storage.load("app.example.com").await.unwrap();
        assert_eq!(loaded.certificate_pem, "CERT");
        assert_eq!(loaded.private_key_pem, "KEY");
        assert!(!loaded.needs_renewal());

        assert!(storage.exists("app.example.com").await);
        assert_eq!(storage.list_domains().await.unwrap(), vec!["app.example.com"]);
    }

    #[tokio::test]
    async fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::new(dir.path());
        assert!(matches!(
            storage.load("missing.example.com").await,
            Err(CertError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_metadata_forces_renewal() {
        let dir = tempfile::tempdir().unwrap();
        let storage = CertStorage::new(dir.path());

        let cert = stored("app.example.com", 90);
        storage.store(&cert).await.unwrap();
        tokio::fs::remove_file(dir.path().join("app.example.com.json"))
            .await
            .unwrap();

        let loaded = storage.load("app.example.com").await.unwrap();
        assert!(loaded.needs_renewal());
    }
}
