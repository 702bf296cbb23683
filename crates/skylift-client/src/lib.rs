//! skylift client: the NAT-side process
//!
//! Registers itself with the server, polls the tunnel list scoped to its
//! client name, and drives a set of reverse-SSH workers toward that
//! desired state. Each worker holds one SSH session with a remote
//! `tcpip_forward` listener and forwards every accepted connection to the
//! configured local upstream.

pub mod poller;
pub mod resolver;
pub mod supervisor;
pub mod worker;

pub use poller::{ApiClient, Poller, PollerError};
pub use resolver::DnsResolver;
pub use supervisor::TunnelSupervisor;
pub use worker::{WorkerContext, WorkerError};
