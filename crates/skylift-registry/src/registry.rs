//! In-memory tunnel registry with snapshot reads and cache validators

use crate::TunnelDescriptor;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("no tunnel registered for {0}")]
    NotFound(String),
}

/// Selects a view of the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelFilter {
    /// Every tunnel.
    All,
    /// Tunnels belonging to one client identity.
    ClientName(String),
}

impl TunnelFilter {
    fn matches(&self, descriptor: &TunnelDescriptor) -> bool {
        match self {
            TunnelFilter::All => true,
            TunnelFilter::ClientName(name) => descriptor.client_name == *name,
        }
    }
}

struct Inner {
    tunnels: HashMap<String, TunnelDescriptor>,
    /// Bumped on every observable mutation.
    version: u64,
}

/// Authoritative map of all tunnels keyed by domain.
///
/// Readers (the router, pollers) always observe a consistent snapshot;
/// writers (admin handlers) serialise on the single mutex. The registry is
/// not persisted: it lives for the process lifetime only.
pub struct TunnelRegistry {
    inner: Mutex<Inner>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tunnels: HashMap::new(),
                version: 0,
            }),
        }
    }

    /// Upsert a tunnel. Returns the previous descriptor when the domain was
    /// already registered.
    pub fn set(&self, descriptor: TunnelDescriptor) -> Option<TunnelDescriptor> {
        let mut inner = self.inner.lock().unwrap();
        debug!(domain = %descriptor.domain, port = descriptor.tunnel_port, "registering tunnel");
        inner.version += 1;
        inner.tunnels.insert(descriptor.domain.clone(), descriptor)
    }

    /// Remove a tunnel, releasing its server-side port for reuse.
    pub fn delete(&self, domain: &str) -> Result<TunnelDescriptor, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.tunnels.remove(domain) {
            Some(descriptor) => {
                debug!(domain = %domain, "deleted tunnel");
                inner.version += 1;
                Ok(descriptor)
            }
            None => Err(RegistryError::NotFound(domain.to_string())),
        }
    }

    /// Loopback port the router splices connections for `domain` to.
    pub fn get_port(&self, domain: &str) -> Result<u16, RegistryError> {
        let inner = self.inner.lock().unwrap();
        inner
            .tunnels
            .get(domain)
            .map(|d| d.tunnel_port)
            .ok_or_else(|| RegistryError::NotFound(domain.to_string()))
    }

    pub fn get(&self, domain: &str) -> Option<TunnelDescriptor> {
        self.inner.lock().unwrap().tunnels.get(domain).cloned()
    }

    pub fn contains(&self, domain: &str) -> bool {
        self.inner.lock().unwrap().tunnels.contains_key(domain)
    }

    /// Consistent snapshot of the filtered view.
    pub fn list(&self, filter: &TunnelFilter) -> HashMap<String, TunnelDescriptor> {
        let inner = self.inner.lock().unwrap();
        inner
            .tunnels
            .values()
            .filter(|d| filter.matches(d))
            .map(|d| (d.domain.clone(), d.clone()))
            .collect()
    }

    /// Opaque cache validator for the filtered view.
    ///
    /// Derived from the content of the view, so it changes exactly when a
    /// tunnel in the view is added, removed, or modified; writes outside
    /// the view leave it untouched.
    pub fn etag(&self, filter: &TunnelFilter) -> String {
        let inner = self.inner.lock().unwrap();
        let mut entries: Vec<&TunnelDescriptor> =
            inner.tunnels.values().filter(|d| filter.matches(d)).collect();
        entries.sort_by(|a, b| a.domain.cmp(&b.domain));

        let mut hasher = Sha256::new();
        for descriptor in entries {
            // Descriptor serialization is infallible: plain structs, no maps.
            hasher.update(serde_json::to_vec(descriptor).unwrap());
            hasher.update([0u8]);
        }
        format!("\"{:x}\"", hasher.finalize())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tunnels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of observable mutations since startup.
    pub fn version(&self) -> u64 {
        self.inner.lock().unwrap().version
    }
}

impl Default for TunnelRegistry {
    fn default() -> Self {
        Self::new()
    }
}
