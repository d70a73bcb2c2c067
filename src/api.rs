use std::{
    net::SocketAddr,
    sync::Arc,
};

use axum::{
    Json,
    Router,
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{any, get},
};

use crate::gateway::{Gateway, HealthReport};

pub fn routes(gateway: Arc<Gateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .fallback(any(proxy))
        .with_state(gateway)
}

async fn health(State(gateway): State<Arc<Gateway>>) -> Json<HealthReport> {
    Json(gateway.health().await)
}

async fn metrics(State(gateway): State<Arc<Gateway>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gateway.render_metrics().await,
    )
}

async fn proxy(State(gateway): State<Arc<Gateway>>, request: Request<Body>) -> Response {
    // absent when the router is driven without a socket (tests, embedding)
    let peer_ip = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    gateway.handle_http(request, peer_ip).await
}
