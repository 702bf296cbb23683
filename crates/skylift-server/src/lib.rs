//! skylift server: the public edge
//!
//! One TCP accept loop on the public TLS port. Each connection is
//! terminated with a certificate picked by SNI, then either handed to the
//! admin control plane or spliced to the loopback port of the tunnel
//! registered for that hostname.

pub mod admin;
pub mod admin_listener;
pub mod auth;
pub mod challenge;
pub mod config;
pub mod router;

pub use admin::{admin_router, AdminState};
pub use admin_listener::{AdminConn, AdminListener, AdminQueue};
pub use auth::{Auth, AuthError, LogNotifier, LoginNotifier};
pub use config::{ConfigError, ServerConfig, SmtpConfig};
pub use router::{ConnectionRouter, RouterError};
