use std::{
    future::Future,
    net::IpAddr,
    sync::Arc,
    time::Duration,
};

use axum::{
    Json,
    body::{
        Body,
        to_bytes,
    },
    http::{
        HeaderName,
        HeaderValue,
        Request,
    },
    response::{
        IntoResponse,
        Response,
    },
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitState},
    clock::Clock,
    config::{GatewayConfig, StoreBackendConfig},
    context::RequestContext,
    error::{GatewayError, GatewayResult},
    extract::{ContextIdentityExtractor, ProxyAwareIpExtractor},
    metrics::{MetricsRegistry, PolicyKind},
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        auth::ApiKeyIdentityMiddleware,
        ip_limit::IpRateLimitMiddleware,
        logging::RequestLoggingMiddleware,
        rate_limit::AdmissionGate,
        user_limit::{TierLimits, UserRateLimitMiddleware},
    },
    ratelimit::{
        AdmissionResult,
        RateLimitStore,
        RateLimiter,
        guarded::GuardedStore,
        in_memory::InMemoryStore,
        redis_backend::RedisStore,
    },
    upstream::Upstream,
};

pub struct Gateway {
    middlewares: Vec<Arc<dyn GatewayMiddleware>>,
    upstream: Option<Upstream>,
    backend: Arc<dyn RateLimitStore>,
    store: Arc<GuardedStore>,
    metrics: Arc<MetricsRegistry>,
    op_timeout: Duration,
    max_body_bytes: usize,
}

/// Limiter health. Reported with HTTP 200 even when degraded since requests
/// keep flowing while the store is unavailable.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub circuit: CircuitState,
    pub key_count: Option<usize>,
    pub memory_bytes: Option<usize>,
}

impl Gateway {
    pub async fn from_config(config: &GatewayConfig, clock: Arc<dyn Clock>) -> GatewayResult<Self> {
        let backend: Arc<dyn RateLimitStore> = match &config.store.backend {
            StoreBackendConfig::InMemory => Arc::new(InMemoryStore::new(config.store.max_keys)),
            StoreBackendConfig::Redis { url, key_prefix } => Arc::new(
                RedisStore::new(
                    url.clone(),
                    key_prefix.clone(),
                    config.store.max_keys,
                    config.retention(),
                )
                .await?,
            ),
        };

        Ok(Self::with_backend(config, backend, clock))
    }

    /// Builds the middleware chain around an already constructed store.
    pub fn with_backend(
        config: &GatewayConfig,
        backend: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            config.circuit_breaker.clone(),
            clock.clone(),
        ));
        let store = Arc::new(GuardedStore::new(
            backend.clone(),
            breaker,
            config.store.op_timeout,
        ));
        let limiter = RateLimiter::new(store.clone(), clock);
        let metrics = Arc::new(MetricsRegistry::new());

        let ip_cfg = &config.ip_rate_limit;
        let user_cfg = &config.user_rate_limit;

        let middlewares: Vec<Arc<dyn GatewayMiddleware>> = vec![
            Arc::new(RequestLoggingMiddleware),
            Arc::new(ApiKeyIdentityMiddleware::new(
                config.api_keys.clone(),
                config.auth_exempt_prefixes.clone(),
            )),
            Arc::new(IpRateLimitMiddleware::new(
                AdmissionGate::new(limiter.clone(), metrics.clone(), PolicyKind::Ip),
                ip_cfg.policy,
                Arc::new(ProxyAwareIpExtractor::new(ip_cfg.trusted_proxies.clone())),
                ip_cfg.enabled,
            )),
            Arc::new(UserRateLimitMiddleware::new(
                AdmissionGate::new(limiter, metrics.clone(), PolicyKind::User),
                TierLimits {
                    default_policy: user_cfg.default_policy,
                    tiers: user_cfg.tier_limits.clone(),
                },
                Arc::new(ContextIdentityExtractor),
                user_cfg.skip_unauthenticated,
                user_cfg.enabled,
            )),
        ];

        let upstream = config.upstream.clone().and_then(|cfg| match Upstream::new(cfg) {
            Ok(upstream) => Some(upstream),
            Err(err) => {
                tracing::error!(error = %err.message(), "upstream client unavailable; serving locally");
                None
            }
        });

        Self {
            middlewares,
            upstream,
            backend,
            store,
            metrics,
            op_timeout: config.store.op_timeout,
            max_body_bytes: config.max_body_bytes,
        }
    }

    /// Unguarded store handle for background maintenance.
    pub fn backend(&self) -> Arc<dyn RateLimitStore> {
        self.backend.clone()
    }

    pub fn metrics(&self) -> &MetricsRegistry {
        &self.metrics
    }

    // Introspection goes straight to the backend under the same deadline so
    // health checks and scrapes never take the breaker's half-open probe.
    async fn introspect<F>(&self, op: F) -> Option<usize>
    where
        F: Future<Output = AdmissionResult<usize>>,
    {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(err)) => {
                tracing::debug!(error = %err, "rate limit store introspection failed");
                None
            }
            Err(_) => None,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let circuit = self.store.breaker_state();
        let key_count = self.introspect(self.backend.key_count()).await;
        let memory_bytes = self.introspect(self.backend.memory_usage()).await;
        let status = if circuit == CircuitState::Open {
            "degraded"
        } else {
            "healthy"
        };

        HealthReport {
            status,
            circuit,
            key_count,
            memory_bytes,
        }
    }

    pub async fn render_metrics(&self) -> String {
        let key_count = self.introspect(self.backend.key_count()).await;
        self.metrics
            .render_prometheus(self.store.breaker_state(), key_count)
    }

    pub async fn handle_http(
        &self,
        request: Request<Body>,
        peer_ip: Option<IpAddr>,
    ) -> Response<Body> {
        let (parts, body) = request.into_parts();
        let max_capture = self.max_body_bytes.saturating_add(1);
        let body = match to_bytes(body, max_capture).await {
            Ok(body) if body.len() <= self.max_body_bytes => body,
            _ => {
                let mut response = GatewayError::PayloadTooLarge.into_response();
                attach_request_id("unknown", &mut response);
                return response;
            }
        };

        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut ctx = RequestContext::new(
            request_id,
            parts.method,
            parts.uri,
            parts.headers,
            body,
            peer_ip,
        );

        let mut executed = Vec::new();

        for (idx, middleware) in self.middlewares.iter().enumerate() {
            match middleware.on_request(&mut ctx).await {
                Ok(ControlFlow::Continue) => executed.push(idx),
                Ok(ControlFlow::ShortCircuit(response)) => {
                    return self.finish(&executed, &ctx, response).await;
                }
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        middleware = middleware.name(),
                        error = %err.message(),
                        "middleware rejected request"
                    );
                    return self.finish(&executed, &ctx, err.into_response()).await;
                }
            }
        }

        let response = match &self.upstream {
            Some(upstream) => match upstream.forward(&ctx).await {
                Ok(response) => response,
                Err(err) => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        upstream = %upstream.base_url(),
                        error = %err.message(),
                        "upstream call failed"
                    );
                    err.into_response()
                }
            },
            None => Json(serde_json::json!({ "status": "ok" })).into_response(),
        };

        self.finish(&executed, &ctx, response).await
    }

    async fn finish(
        &self,
        executed: &[usize],
        ctx: &RequestContext,
        mut response: Response<Body>,
    ) -> Response<Body> {
        for idx in executed.iter().rev() {
            let middleware = &self.middlewares[*idx];
            if let Err(err) = middleware.on_response(ctx, &mut response).await {
                tracing::warn!(
                    request_id = %ctx.request_id,
                    middleware = middleware.name(),
                    error = %err.message(),
                    "middleware post-response hook failed"
                );
            }
        }
        attach_request_id(&ctx.request_id, &mut response);
        response
    }
}

fn attach_request_id(request_id: &str, response: &mut Response<Body>) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static("x-request-id"), value);
    }
}
