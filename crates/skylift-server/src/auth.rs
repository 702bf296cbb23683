//! Magic-link login and bearer tokens
//!
//! `login` mints a token and a verification key, delivers the key to the
//! user out-of-band, and returns the token to the caller. The token only
//! authorizes requests after `verify` has been called with the key.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid verification key")]
    InvalidKey,
}

/// Delivers the verification link for a login request. Mail transport is
/// an external collaborator; the default implementation logs the URL.
pub trait LoginNotifier: Send + Sync {
    fn deliver(&self, email: &str, verify_url: &str);
}

/// Fallback notifier: writes the verification link to the log.
pub struct LogNotifier;

impl LoginNotifier for LogNotifier {
    fn deliver(&self, email: &str, verify_url: &str) {
        info!(email = %email, url = %verify_url, "login verification link");
    }
}

struct AuthInner {
    /// Verification key -> token awaiting verification.
    pending: HashMap<String, String>,
    authorized: HashSet<String>,
}

pub struct Auth {
    inner: Mutex<AuthInner>,
    notifier: Box<dyn LoginNotifier>,
    admin_domain: String,
}

impl Auth {
    pub fn new(admin_domain: String, notifier: Box<dyn LoginNotifier>) -> Self {
        Self {
            inner: Mutex::new(AuthInner {
                pending: HashMap::new(),
                authorized: HashSet::new(),
            }),
            notifier,
            admin_domain,
        }
    }

    /// Authorize a token directly, bypassing the login flow. Used for
    /// tokens provisioned through configuration.
    pub fn grant(&self, token: String) {
        self.inner.lock().unwrap().authorized.insert(token);
    }

    /// Start a login: mints a token, delivers the verification link, and
    /// returns the token. The token is inert until verified.
    pub fn login(&self, email: &str) -> String {
        let token = Uuid::new_v4().to_string();
        let key = Uuid::new_v4().to_string();

        self.inner
            .lock()
            .unwrap()
            .pending
            .insert(key.clone(), token.clone());

        let verify_url = format!("https://{}/verify?key={}", self.admin_domain, key);
        self.notifier.deliver(email, &verify_url);
        token
    }

    /// Complete a login from the delivered key.
    pub fn verify(&self, key: &str) -> Result<(), AuthError> {
        let mut inner = self.inner.lock().unwrap();
        let token = inner.pending.remove(key).ok_or(AuthError::InvalidKey)?;
        inner.authorized.insert(token);
        Ok(())
    }

    pub fn authorized(&self, token: &str) -> bool {
        self.inner.lock().unwrap().authorized.contains(token)
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
/// The scheme match is case-insensitive per RFC 6750.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
