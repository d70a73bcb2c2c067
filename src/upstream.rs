use axum::{
    body::Body,
    response::Response,
};
use http::header::HeaderName;
use std::time::Duration;

use crate::{
    config::UpstreamConfig,
    context::RequestContext,
    error::{GatewayError, GatewayResult},
};

/// The protected service that admitted requests are relayed to.
#[derive(Clone)]
pub struct Upstream {
    client: reqwest::Client,
    cfg: UpstreamConfig,
}

impl Upstream {
    pub fn new(cfg: UpstreamConfig) -> GatewayResult<Self> {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        Ok(Self { client, cfg })
    }

    pub fn base_url(&self) -> &str {
        &self.cfg.base_url
    }

    pub async fn forward(&self, ctx: &RequestContext) -> GatewayResult<Response<Body>> {
        let path_and_query = ctx
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or(ctx.uri.path());
        let target_url = format!("{}{}", self.cfg.base_url, path_and_query);

        let mut request = self
            .client
            .request(ctx.method.clone(), &target_url)
            .body(ctx.body.clone());

        for (name, value) in &ctx.headers {
            if should_forward_header(name) {
                request = request.header(name, value);
            }
        }

        request = request.header("x-request-id", ctx.request_id.clone());
        if let Some(peer_ip) = ctx.peer_ip {
            let forwarded = match ctx.headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
                Some(prior) => format!("{prior}, {peer_ip}"),
                None => peer_ip.to_string(),
            };
            request = request.header("x-forwarded-for", forwarded);
        }

        let upstream_response = request.timeout(self.cfg.timeout).send().await?;
        let status = upstream_response.status();
        let headers = upstream_response.headers().clone();
        let body = upstream_response.bytes().await?;

        let mut builder = Response::builder().status(status);
        for (name, value) in &headers {
            if should_forward_header(name) {
                builder = builder.header(name, value);
            }
        }

        builder
            .body(Body::from(body))
            .map_err(|e| GatewayError::Internal(e.to_string()))
    }
}

fn should_forward_header(name: &HeaderName) -> bool {
    !matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
            | "x-forwarded-for"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_headers_are_dropped() {
        assert!(!should_forward_header(&HeaderName::from_static("connection")));
        assert!(!should_forward_header(&HeaderName::from_static("x-forwarded-for")));
        assert!(should_forward_header(&HeaderName::from_static("x-api-key")));
        assert!(should_forward_header(&HeaderName::from_static("content-type")));
    }
}
