use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use admission::{
    api,
    clock::ManualClock,
    config::GatewayConfig,
    gateway::Gateway,
    ratelimit::in_memory::InMemoryStore,
};
use axum::{
    Router,
    body::{Body, to_bytes},
    extract::ConnectInfo,
    http::{Request, StatusCode},
    response::Response,
};
use tower::ServiceExt;

fn app(vars: &[(&str, &str)]) -> (Router, Arc<ManualClock>) {
    let vars: HashMap<String, String> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let cfg = GatewayConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
    let clock = Arc::new(ManualClock::starting_at_epoch_millis(1_700_000_000_000));
    let gateway = Gateway::with_backend(&cfg, Arc::new(InMemoryStore::new(1_000)), clock.clone());
    (api::routes(Arc::new(gateway)), clock)
}

fn from_peer(peer: &str, path: &str) -> axum::http::request::Builder {
    let addr: SocketAddr = format!("{peer}:40000").parse().unwrap();
    Request::builder()
        .uri(path)
        .extension(ConnectInfo(addr))
}

async fn send(app: &Router, request: Request<Body>) -> Response {
    app.clone().oneshot(request).await.unwrap()
}

async fn json(response: Response) -> serde_json::Value {
    let body = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn ip_quota_is_enforced_and_recovers_after_the_window() {
    let (app, clock) = app(&[("IP_RATE_LIMIT", "3"), ("IP_RATE_LIMIT_WINDOW_MS", "10000")]);

    for remaining in ["2", "1", "0"] {
        let response = send(&app, from_peer("198.51.100.4", "/items").body(Body::empty()).unwrap()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-remaining"], remaining);
        assert_eq!(response.headers()["x-ratelimit-limit"], "3");
    }

    let denied = send(&app, from_peer("198.51.100.4", "/items").body(Body::empty()).unwrap()).await;
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(denied.headers()["retry-after"], "10");
    let body = json(denied).await;
    assert_eq!(body["error"], "rate_limit_exceeded");
    assert_eq!(body["retry_after"], 10);

    // a different client is unaffected
    let other = send(&app, from_peer("198.51.100.5", "/items").body(Body::empty()).unwrap()).await;
    assert_eq!(other.status(), StatusCode::OK);

    clock.advance(Duration::from_millis(10_001));
    let again = send(&app, from_peer("198.51.100.4", "/items").body(Body::empty()).unwrap()).await;
    assert_eq!(again.status(), StatusCode::OK);
}

#[tokio::test]
async fn forwarded_for_is_ignored_from_untrusted_peers() {
    let (app, _) = app(&[("IP_RATE_LIMIT", "1")]);

    let first = from_peer("198.51.100.9", "/")
        .header("x-forwarded-for", "192.0.2.1")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, first).await.status(), StatusCode::OK);

    // spoofed header does not buy a fresh quota
    let second = from_peer("198.51.100.9", "/")
        .header("x-forwarded-for", "192.0.2.2")
        .body(Body::empty())
        .unwrap();
    assert_eq!(send(&app, second).await.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn trusted_proxy_forwards_the_client_address() {
    let (app, _) = app(&[("IP_RATE_LIMIT", "1"), ("TRUSTED_PROXIES", "10.0.0.1")]);

    for client in ["192.0.2.1", "192.0.2.2"] {
        let request = from_peer("10.0.0.1", "/")
            .header("x-forwarded-for", client)
            .body(Body::empty())
            .unwrap();
        assert_eq!(send(&app, request).await.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn unknown_api_key_is_rejected_before_counting() {
    let (app, _) = app(&[("API_KEYS", "alice:basic:k-alice")]);

    let request = from_peer("198.51.100.4", "/items")
        .header("x-api-key", "nope")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().contains_key("x-request-id"));
    assert!(!response.headers().contains_key("x-ratelimit-type"));
}

#[tokio::test]
async fn health_and_metrics_report_limiter_state() {
    let (app, _) = app(&[("API_KEYS", "alice:basic:k-alice")]);

    let request = from_peer("198.51.100.4", "/items")
        .header("x-api-key", "k-alice")
        .body(Body::empty())
        .unwrap();
    let response = send(&app, request).await;
    assert_eq!(response.headers()["x-ratelimit-type"], "user");

    let health = send(&app, from_peer("198.51.100.4", "/health").body(Body::empty()).unwrap()).await;
    assert_eq!(health.status(), StatusCode::OK);
    let health = json(health).await;
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["circuit"], "closed");
    assert_eq!(health["key_count"], 2);

    let metrics = send(&app, from_peer("198.51.100.4", "/metrics").body(Body::empty()).unwrap()).await;
    let body = to_bytes(metrics.into_body(), 64 * 1024).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("ratelimit_allowed_total{policy=\"ip\"} 1"));
    assert!(text.contains("ratelimit_allowed_total{policy=\"user\"} 1"));
    assert!(text.contains("ratelimit_store_keys 2"));
}
