//! Plain-HTTP listener for ACME HTTP-01 challenges
//!
//! The router owns the TLS port, so validation happens over port 80: the
//! CA fetches `/.well-known/acme-challenge/{token}` and must receive the
//! key authorization published by the ACME client.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use skylift_cert::Http01Responses;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info};

pub fn challenge_router(responses: Arc<Http01Responses>) -> Router {
    Router::new()
        .route(
            "/.well-known/acme-challenge/{token}",
            get(serve_key_authorization),
        )
        .with_state(responses)
}

async fn serve_key_authorization(
    State(responses): State<Arc<Http01Responses>>,
    Path(token): Path<String>,
) -> Result<String, StatusCode> {
    match responses.get(&token) {
        Some(key_authorization) => {
            debug!(token = %token, "served http-01 key authorization");
            Ok(key_authorization)
        }
        None => Err(StatusCode::NOT_FOUND),
    }
}

/// Serve the challenge router on `listener` until the process exits.
pub async fn serve_http01(
    listener: TcpListener,
    responses: Arc<Http01Responses>,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, "http-01 challenge listener ready");
    axum::serve(listener, challenge_router(responses)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn test_known_token_served() {
        let responses = Arc::new(Http01Responses::new());
        responses.insert("tok".to_string(), "tok.thumbprint".to_string());
        let router = challenge_router(responses);

        let response = router
            .oneshot(
                Request::builder()
                    .uri("/.well-known/acme-challenge/tok")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"tok.thumbprint");
    }

    #[tokio::test]
    async fn test_unknown_token_404() {
        let router = challenge_router(Arc::new(Http01Responses::new()));
        let response = router
            .oneshot(
                Request::builder()
                    .uri("/.well-known/acme-challenge/missing")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
