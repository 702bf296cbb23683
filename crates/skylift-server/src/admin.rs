//! Admin control plane API
//!
//! Served over connections the router hands to the admin listener. Exposes
//! the login flow and bearer-token-authenticated CRUD over the tunnel
//! registry. The tunnel list response always carries an `ETag` header so
//! clients can skip unchanged states.

use crate::auth::{bearer_token, Auth};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use skylift_cert::CertManager;
use skylift_registry::{TunnelDescriptor, TunnelFilter, TunnelRegistry};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

pub struct AdminState {
    pub registry: Arc<TunnelRegistry>,
    pub auth: Arc<Auth>,
    pub certs: Arc<CertManager>,
    /// Registered client identities (`user/client-name`).
    clients: Mutex<HashSet<String>>,
}

impl AdminState {
    pub fn new(registry: Arc<TunnelRegistry>, auth: Arc<Auth>, certs: Arc<CertManager>) -> Self {
        Self {
            registry,
            auth,
            certs,
            clients: Mutex::new(HashSet::new()),
        }
    }
}

/// Build the admin router. `/login` and `/verify` are public; everything
/// else requires an authorized bearer token.
pub fn admin_router(state: Arc<AdminState>) -> Router {
    let protected = Router::new()
        .route("/", get(index))
        .route(
            "/api/tunnels",
            get(list_tunnels).post(create_tunnel).delete(delete_tunnel),
        )
        .route("/api/users/{user}/clients/{name}", put(register_client))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_bearer,
        ));

    Router::new()
        .route("/login", post(login))
        .route("/verify", get(verify))
        .merge(protected)
        .with_state(state)
}

/// Missing token -> 401, unknown token -> 403.
async fn require_bearer(
    State(state): State<Arc<AdminState>>,
    request: Request,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token);

    match token {
        None => (StatusCode::UNAUTHORIZED, "No token provided").into_response(),
        Some(token) if !state.auth.authorized(token) => {
            (StatusCode::FORBIDDEN, "Not authorized").into_response()
        }
        Some(_) => next.run(request).await,
    }
}

async fn index() -> &'static str {
    "skylift admin\n"
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    email: Option<String>,
}

async fn login(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<LoginQuery>,
) -> Response {
    let Some(email) = query.email else {
        return (StatusCode::BAD_REQUEST, "Email required for login").into_response();
    };
    let token = state.auth.login(&email);
    token.into_response()
}

#[derive(Debug, Deserialize)]
struct VerifyQuery {
    key: Option<String>,
}

async fn verify(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<VerifyQuery>,
) -> Response {
    let Some(key) = query.key else {
        return (StatusCode::BAD_REQUEST, "Must provide key for verification").into_response();
    };
    match state.auth.verify(&key) {
        Ok(()) => {
            "Verification successful. You can close this tab and return to your original session."
                .into_response()
        }
        Err(_) => (StatusCode::BAD_REQUEST, "Invalid key").into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TunnelListQuery {
    #[serde(rename = "client-name")]
    client_name: Option<String>,
}

fn filter_from(query: &TunnelListQuery) -> TunnelFilter {
    match &query.client_name {
        Some(name) => TunnelFilter::ClientName(name.clone()),
        None => TunnelFilter::All,
    }
}

async fn list_tunnels(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<TunnelListQuery>,
) -> Response {
    let filter = filter_from(&query);
    let tunnels = state.registry.list(&filter);
    let etag = state.registry.etag(&filter);
    ([(header::ETAG, etag)], Json(tunnels)).into_response()
}

async fn create_tunnel(
    State(state): State<Arc<AdminState>>,
    Json(descriptor): Json<TunnelDescriptor>,
) -> Response {
    // The hostname must be servable before it is advertised: blocks on
    // provisioning the first time, cache hit afterwards.
    if let Err(e) = state.certs.ensure(&descriptor.domain).await {
        warn!(domain = %descriptor.domain, "certificate provisioning failed: {}", e);
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to obtain certificate for {}", descriptor.domain),
        )
            .into_response();
    }

    info!(domain = %descriptor.domain, port = descriptor.tunnel_port, "tunnel created");
    state.registry.set(descriptor);
    StatusCode::OK.into_response()
}

#[derive(Debug, Deserialize)]
struct DeleteTunnelQuery {
    host: Option<String>,
}

async fn delete_tunnel(
    State(state): State<Arc<AdminState>>,
    Query(query): Query<DeleteTunnelQuery>,
) -> Response {
    let Some(host) = query.host else {
        return (StatusCode::BAD_REQUEST, "Invalid host parameter").into_response();
    };
    match state.registry.delete(&host) {
        Ok(_) => {
            info!(domain = %host, "tunnel deleted");
            StatusCode::OK.into_response()
        }
        Err(e) => (StatusCode::NOT_FOUND, e.to_string()).into_response(),
    }
}

async fn register_client(
    State(state): State<Arc<AdminState>>,
    Path((user, name)): Path<(String, String)>,
) -> StatusCode {
    info!(user = %user, client = %name, "client registered");
    state
        .clients
        .lock()
        .unwrap()
        .insert(format!("{}/{}", user, name));
    StatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LogNotifier;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use http_body_util::BodyExt;
    use skylift_cert::acme::{AcmeConfig, AlpnChallenges, ChallengeMode};
    use skylift_cert::storage::StoredCertificate;
    use skylift_cert::{AcmeClient, CertStorage, CertStore};
    use skylift_registry::TlsTermination;
    use tower::util::ServiceExt;

    fn state_with_token(dir: &std::path::Path, token: &str) -> Arc<AdminState> {
        let registry = Arc::new(TunnelRegistry::new());
        let auth = Arc::new(Auth::new(
            "admin.example.com".to_string(),
            Box::new(LogNotifier),
        ));
        auth.grant(token.to_string());

        let storage = CertStorage::new(dir);
        let acme = AcmeClient::new(
            AcmeConfig {
                contact_email: "admin@example.com".to_string(),
                use_staging: true,
                mode: ChallengeMode::TlsAlpn01 {
                    challenges: Arc::new(AlpnChallenges::new()),
                },
            },
            storage.clone(),
        );
        let certs = Arc::new(CertManager::new(Arc::new(CertStore::new()), storage, acme));

        Arc::new(AdminState::new(registry, auth, certs))
    }

    async fn seed_certificate(dir: &std::path::Path, domain: &str) {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec![domain.to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();
        CertStorage::new(dir)
            .store(&StoredCertificate {
                domain: domain.to_string(),
                certificate_pem: cert.pem(),
                private_key_pem: key_pair.serialize_pem(),
                expires_at: chrono::Utc::now() + chrono::Duration::days(60),
                created_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    fn descriptor(domain: &str, client: &str) -> TunnelDescriptor {
        TunnelDescriptor {
            domain: domain.to_string(),
            server_address: "edge.example.com".to_string(),
            server_port: 22,
            username: "tunnel".to_string(),
            client_name: client.to_string(),
            tunnel_private_key: "KEY".to_string(),
            tunnel_port: 9000,
            client_address: "localhost".to_string(),
            client_port: 8080,
            allow_external_tcp: false,
            tls_termination: TlsTermination::Server,
        }
    }

    #[tokio::test]
    async fn test_missing_token_is_401_invalid_is_403() {
        let dir = tempfile::tempdir().unwrap();
        let router = admin_router(state_with_token(dir.path(), "good-token"));

        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/tunnels")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/tunnels")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_tunnel_crud_and_etag() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_token(dir.path(), "token");
        seed_certificate(dir.path(), "app.example.com").await;
        let router = admin_router(state.clone());

        let list = |router: Router| async move {
            router
                .oneshot(
                    HttpRequest::builder()
                        .uri("/api/tunnels?client-name=laptop")
                        .header("authorization", "Bearer token")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap()
        };

        let response = list(router.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let etag_empty = response.headers()[header::ETAG].to_str().unwrap().to_string();

        let body = serde_json::to_vec(&descriptor("app.example.com", "laptop")).unwrap();
        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/api/tunnels")
                    .header("authorization", "Bearer token")
                    .header("content-type", "application/json")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = list(router.clone()).await;
        let etag_one = response.headers()[header::ETAG].to_str().unwrap().to_string();
        assert_ne!(etag_empty, etag_one);

        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let tunnels: std::collections::HashMap<String, TunnelDescriptor> =
            serde_json::from_slice(&bytes).unwrap();
        assert_eq!(tunnels.len(), 1);
        assert_eq!(tunnels["app.example.com"].tunnel_port, 9000);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("DELETE")
                    .uri("/api/tunnels?host=app.example.com")
                    .header("authorization", "Bearer token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = list(router).await;
        let etag_back = response.headers()[header::ETAG].to_str().unwrap().to_string();
        assert_eq!(etag_back, etag_empty);
    }

    #[tokio::test]
    async fn test_register_client_returns_200() {
        let dir = tempfile::tempdir().unwrap();
        let router = admin_router(state_with_token(dir.path(), "token"));

        let response = router
            .oneshot(
                HttpRequest::builder()
                    .method("PUT")
                    .uri("/api/users/admin/clients/laptop")
                    .header("authorization", "Bearer token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_login_token_inert_until_verified() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_token(dir.path(), "unused");
        let router = admin_router(state.clone());

        let response = router
            .clone()
            .oneshot(
                HttpRequest::builder()
                    .method("POST")
                    .uri("/login?email=user@example.com")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let token_bytes = response.into_body().collect().await.unwrap().to_bytes();
        let token = String::from_utf8(token_bytes.to_vec()).unwrap();

        assert!(!state.auth.authorized(&token));
    }
}
