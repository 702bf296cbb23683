//! Authoritative tunnel registry
//!
//! Maps public hostnames (TLS SNI values) to tunnel descriptors. The
//! registry is the single source of truth: the connection router reads it
//! per-connection and clients converge toward it through the poll API.

mod descriptor;
mod registry;

pub use descriptor::{TlsTermination, TunnelDescriptor};
pub use registry::{RegistryError, TunnelFilter, TunnelRegistry};
