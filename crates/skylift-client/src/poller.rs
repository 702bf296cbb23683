//! Desired-state poller
//!
//! Every two seconds the client fetches the tunnel list scoped to its
//! name. The response's `ETag` header is the cache validator: when it
//! matches the previous poll nothing is reconciled, so an idle client
//! costs one request per interval and zero supervisor work.

use crate::supervisor::TunnelSupervisor;
use reqwest::StatusCode;
use skylift_registry::TunnelDescriptor;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(StatusCode),

    #[error("tunnel list response is missing the ETag header")]
    MissingEtag,
}

/// Authenticated HTTP client for the server's tunnel API.
pub struct ApiClient {
    http: reqwest::Client,
    server: String,
    token: String,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, server: String, token: String) -> Self {
        Self {
            http,
            server,
            token,
        }
    }

    /// Base URL for the server. A bare host gets the implicit `https://`;
    /// an explicit scheme is kept as-is.
    fn base_url(&self) -> String {
        if self.server.contains("://") {
            self.server.clone()
        } else {
            format!("https://{}", self.server)
        }
    }

    /// One-shot registration of this client identity. Any 2xx counts as
    /// success; the admin API legitimately answers 200, 201, or 204.
    pub async fn register_client(&self, user: &str, client_name: &str) -> Result<(), PollerError> {
        let url = format!(
            "{}/api/users/{}/clients/{}",
            self.base_url(),
            user,
            client_name
        );
        let response = self
            .http
            .put(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(PollerError::Status(response.status()));
        }
        info!(user = %user, client = %client_name, "client registered");
        Ok(())
    }

    /// Fetch the tunnel list for `client_name`. Returns the ETag and the
    /// parsed body.
    pub async fn fetch_tunnels(
        &self,
        client_name: &str,
    ) -> Result<(String, HashMap<String, TunnelDescriptor>), PollerError> {
        let url = format!(
            "{}/api/tunnels?client-name={}",
            self.base_url(),
            client_name
        );
        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if response.status() != StatusCode::OK {
            return Err(PollerError::Status(response.status()));
        }

        let etag = response
            .headers()
            .get(reqwest::header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or(PollerError::MissingEtag)?;

        let tunnels = response.json().await?;
        Ok((etag, tunnels))
    }
}

pub struct Poller {
    api: ApiClient,
    client_name: String,
    supervisor: Arc<TunnelSupervisor>,
    previous_etag: Option<String>,
}

impl Poller {
    pub fn new(api: ApiClient, client_name: String, supervisor: Arc<TunnelSupervisor>) -> Self {
        Self {
            api,
            client_name,
            supervisor,
            previous_etag: None,
        }
    }

    /// One poll step. Returns true when the desired state changed and a
    /// reconciliation ran.
    pub async fn poll_once(&mut self) -> Result<bool, PollerError> {
        let (etag, tunnels) = self.api.fetch_tunnels(&self.client_name).await?;

        if self.previous_etag.as_deref() == Some(etag.as_str()) {
            return Ok(false);
        }

        debug!(etag = %etag, tunnels = tunnels.len(), "desired state changed");
        self.supervisor.reconcile(tunnels);
        self.previous_etag = Some(etag);
        Ok(true)
    }

    /// Poll until the process exits. Transport errors and bad statuses
    /// are logged and the loop continues.
    pub async fn run(mut self) {
        loop {
            if let Err(e) = self.poll_once().await {
                warn!("poll failed: {}", e);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}
