//! Poller + supervisor against a live tunnel API
//!
//! A real registry backs a minimal axum server; the poller's ETag caching
//! and the supervisor's reconciliation are exercised end to end. SSH
//! workers are replaced with a recording spawner.

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use skylift_client::{ApiClient, Poller, TunnelSupervisor};
use skylift_registry::{TlsTermination, TunnelDescriptor, TunnelFilter, TunnelRegistry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Deserialize)]
struct ListQuery {
    #[serde(rename = "client-name")]
    client_name: String,
}

async fn list_tunnels(
    State(registry): State<Arc<TunnelRegistry>>,
    Query(query): Query<ListQuery>,
) -> impl IntoResponse {
    let filter = TunnelFilter::ClientName(query.client_name);
    let etag = registry.etag(&filter);
    ([(header::ETAG, etag)], Json(registry.list(&filter)))
}

async fn register_client() -> StatusCode {
    // Deliberately not 200: registration accepts any 2xx.
    StatusCode::NO_CONTENT
}

async fn start_api(registry: Arc<TunnelRegistry>) -> String {
    let router = Router::new()
        .route("/api/tunnels", get(list_tunnels))
        .route("/api/users/{user}/clients/{name}", put(register_client))
        .with_state(registry);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}", addr)
}

fn descriptor(domain: &str, client: &str, client_port: u16) -> TunnelDescriptor {
    TunnelDescriptor {
        domain: domain.to_string(),
        server_address: "127.0.0.1".to_string(),
        server_port: 22,
        username: "tunnel".to_string(),
        client_name: client.to_string(),
        tunnel_private_key: "KEY".to_string(),
        tunnel_port: 9000,
        client_address: "localhost".to_string(),
        client_port,
        allow_external_tcp: false,
        tls_termination: TlsTermination::Server,
    }
}

struct Recorder {
    starts: AtomicUsize,
    tokens: Mutex<Vec<(String, CancellationToken)>>,
}

fn recording_supervisor() -> (Arc<Recorder>, Arc<TunnelSupervisor>) {
    let recorder = Arc::new(Recorder {
        starts: AtomicUsize::new(0),
        tokens: Mutex::new(Vec::new()),
    });
    let r = recorder.clone();
    let supervisor = Arc::new(TunnelSupervisor::new(move |d: TunnelDescriptor, cancel| {
        r.starts.fetch_add(1, Ordering::SeqCst);
        r.tokens.lock().unwrap().push((d.domain, cancel));
    }));
    (recorder, supervisor)
}

#[tokio::test]
async fn test_poll_reconcile_lifecycle() {
    let registry = Arc::new(TunnelRegistry::new());
    registry.set(descriptor("a.example.com", "laptop", 8080));
    registry.set(descriptor("b.example.com", "laptop", 8080));
    // Another client's tunnel must stay invisible to this poller.
    registry.set(descriptor("other.example.com", "desktop", 8080));

    let server = start_api(registry.clone()).await;
    let api = ApiClient::new(reqwest::Client::new(), server, "token".to_string());
    api.register_client("admin", "laptop").await.unwrap();

    let (recorder, supervisor) = recording_supervisor();
    let mut poller = Poller::new(api, "laptop".to_string(), supervisor.clone());

    // First poll sees {a, b}.
    assert!(poller.poll_once().await.unwrap());
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 2);
    let mut domains = supervisor.active_domains();
    domains.sort();
    assert_eq!(domains, vec!["a.example.com", "b.example.com"]);

    // Unchanged view: the ETag suppresses reconciliation entirely.
    for _ in 0..5 {
        assert!(!poller.poll_once().await.unwrap());
    }
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 2);

    // A mutation on another client's view also changes nothing here.
    registry.set(descriptor("other.example.com", "desktop", 9999));
    assert!(!poller.poll_once().await.unwrap());

    // b changes its upstream port: exactly one cancel and one new start.
    registry.set(descriptor("b.example.com", "laptop", 8081));
    assert!(poller.poll_once().await.unwrap());
    assert_eq!(recorder.starts.load(Ordering::SeqCst), 3);
    {
        let tokens = recorder.tokens.lock().unwrap();
        let b_tokens: Vec<_> = tokens.iter().filter(|(d, _)| d == "b.example.com").collect();
        assert_eq!(b_tokens.len(), 2);
        assert!(b_tokens[0].1.is_cancelled());
        assert!(!b_tokens[1].1.is_cancelled());
        let a_token = tokens.iter().find(|(d, _)| d == "a.example.com").unwrap();
        assert!(!a_token.1.is_cancelled(), "a must be untouched");
    }

    // b disappears server-side: its worker is cancelled, a keeps running.
    registry.delete("b.example.com").unwrap();
    assert!(poller.poll_once().await.unwrap());
    assert_eq!(supervisor.active_domains(), vec!["a.example.com"]);
    {
        let tokens = recorder.tokens.lock().unwrap();
        let last_b = tokens.iter().filter(|(d, _)| d == "b.example.com").last().unwrap();
        assert!(last_b.1.is_cancelled());
        let a_token = tokens.iter().find(|(d, _)| d == "a.example.com").unwrap();
        assert!(!a_token.1.is_cancelled());
    }
}

#[tokio::test]
async fn test_missing_etag_is_an_error() {
    // A server that never sets ETag breaks the caching contract.
    let router = Router::new().route(
        "/api/tunnels",
        get(|| async { Json(std::collections::HashMap::<String, TunnelDescriptor>::new()) }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let api = ApiClient::new(
        reqwest::Client::new(),
        format!("http://{}", addr),
        "token".to_string(),
    );
    assert!(api.fetch_tunnels("laptop").await.is_err());
}

#[tokio::test]
async fn test_non_200_poll_is_transient_error() {
    let router = Router::new().route(
        "/api/tunnels",
        get(|| async { StatusCode::SERVICE_UNAVAILABLE }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let api = ApiClient::new(
        reqwest::Client::new(),
        format!("http://{}", addr),
        "token".to_string(),
    );
    let (_, supervisor) = recording_supervisor();
    let mut poller = Poller::new(api, "laptop".to_string(), supervisor.clone());

    assert!(poller.poll_once().await.is_err());
    assert!(supervisor.is_empty(), "errors must not reconcile");
}
