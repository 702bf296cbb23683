//! Tunnel supervisor: desired-state reconciliation
//!
//! Keeps the running set of per-tunnel workers equal to the last polled
//! desired state. Workers are compared descriptor-by-descriptor: any field
//! change means the old worker is cancelled before its replacement starts.

use skylift_registry::TunnelDescriptor;
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;

struct WorkerHandle {
    descriptor: TunnelDescriptor,
    cancel: CancellationToken,
}

/// Starts a worker for a descriptor; the token cancels it cooperatively.
pub type WorkerSpawner = Box<dyn Fn(TunnelDescriptor, CancellationToken) + Send + Sync>;

pub struct TunnelSupervisor {
    /// Reconciliation and shutdown can race; one lock covers the map.
    workers: Mutex<HashMap<String, WorkerHandle>>,
    spawner: WorkerSpawner,
}

impl TunnelSupervisor {
    pub fn new(spawner: impl Fn(TunnelDescriptor, CancellationToken) + Send + Sync + 'static) -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
            spawner: Box::new(spawner),
        }
    }

    /// Drive the worker set toward `desired`. Identical descriptors are
    /// left untouched, so applying the same state twice is a no-op.
    pub fn reconcile(&self, desired: HashMap<String, TunnelDescriptor>) {
        let mut workers = self.workers.lock().unwrap();

        for (domain, descriptor) in &desired {
            match workers.get(domain) {
                None => {
                    info!(domain = %domain, "starting tunnel");
                    let cancel = CancellationToken::new();
                    (self.spawner)(descriptor.clone(), cancel.clone());
                    workers.insert(
                        domain.clone(),
                        WorkerHandle {
                            descriptor: descriptor.clone(),
                            cancel,
                        },
                    );
                }
                Some(existing) if existing.descriptor != *descriptor => {
                    info!(domain = %domain, "restarting tunnel with updated descriptor");
                    existing.cancel.cancel();
                    let cancel = CancellationToken::new();
                    (self.spawner)(descriptor.clone(), cancel.clone());
                    workers.insert(
                        domain.clone(),
                        WorkerHandle {
                            descriptor: descriptor.clone(),
                            cancel,
                        },
                    );
                }
                Some(_) => {}
            }
        }

        workers.retain(|domain, handle| {
            if desired.contains_key(domain) {
                true
            } else {
                info!(domain = %domain, "cancelling removed tunnel");
                handle.cancel.cancel();
                false
            }
        });
    }

    /// Cancel every worker. Used at process shutdown.
    pub fn shutdown(&self) {
        let mut workers = self.workers.lock().unwrap();
        for (domain, handle) in workers.drain() {
            info!(domain = %domain, "cancelling tunnel");
            handle.cancel.cancel();
        }
    }

    pub fn active_domains(&self) -> Vec<String> {
        self.workers.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.workers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
