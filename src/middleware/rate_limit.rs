use std::sync::Arc;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{IntoResponse, Response},
};

use crate::{
    context::RequestContext,
    error::GatewayError,
    metrics::{MetricsRegistry, PolicyKind},
    middleware::ControlFlow,
    ratelimit::{Decision, LimitPolicy, RateLimiter},
};

/// Policy that last ruled on the request and what it decided
/// (`allowed`, `limited` or `degraded`).
pub const META_POLICY: &str = "ratelimit.policy";
pub const META_OUTCOME: &str = "ratelimit.outcome";
pub const META_REMAINING: &str = "ratelimit.remaining";

const META_TYPE: &str = "ratelimit.type";
const META_LIMIT: &str = "ratelimit.limit";
const META_RESET: &str = "ratelimit.reset";

/// Shared enforcement path for the IP and user policies: decide, count the
/// outcome, and fail open whenever the store cannot answer.
pub struct AdmissionGate {
    limiter: RateLimiter,
    metrics: Arc<MetricsRegistry>,
    kind: PolicyKind,
}

impl AdmissionGate {
    pub fn new(limiter: RateLimiter, metrics: Arc<MetricsRegistry>, kind: PolicyKind) -> Self {
        Self {
            limiter,
            metrics,
            kind,
        }
    }

    pub fn skip(&self) {
        self.metrics.skipped(self.kind);
    }

    pub async fn admit(
        &self,
        ctx: &mut RequestContext,
        key: &str,
        policy: &LimitPolicy,
    ) -> ControlFlow {
        match self.limiter.check(key, policy).await {
            Ok(decision) if decision.allowed => {
                self.metrics.allowed(self.kind);
                self.record_outcome(ctx, "allowed");
                self.remember(ctx, &decision);
                ControlFlow::Continue
            }
            Ok(decision) => {
                self.metrics.denied(self.kind);
                self.record_outcome(ctx, "limited");
                tracing::debug!(
                    request_id = %ctx.request_id,
                    policy = self.kind.as_str(),
                    key = %key,
                    limit = decision.limit,
                    retry_after_secs = decision.retry_after_secs(),
                    "rate limit exceeded"
                );
                ControlFlow::ShortCircuit(self.limited_response(&decision))
            }
            Err(err) => {
                self.metrics.degraded(self.kind);
                self.record_outcome(ctx, "degraded");
                tracing::warn!(
                    request_id = %ctx.request_id,
                    policy = self.kind.as_str(),
                    key = %key,
                    reason = err.kind(),
                    error = %err,
                    "rate limiter degraded; allowing request"
                );
                ControlFlow::Continue
            }
        }
    }

    fn record_outcome(&self, ctx: &mut RequestContext, outcome: &str) {
        // a degraded earlier policy stays visible past a later allow
        let prior = ctx.metadata.get(META_OUTCOME).map(String::as_str);
        if outcome == "allowed" && prior == Some("degraded") {
            return;
        }
        ctx.metadata
            .insert(META_POLICY.to_string(), self.kind.as_str().to_string());
        ctx.metadata
            .insert(META_OUTCOME.to_string(), outcome.to_string());
    }

    fn remember(&self, ctx: &mut RequestContext, decision: &Decision) {
        ctx.metadata
            .insert(META_TYPE.to_string(), self.kind.as_str().to_string());
        ctx.metadata
            .insert(META_LIMIT.to_string(), decision.limit.to_string());
        ctx.metadata
            .insert(META_REMAINING.to_string(), decision.remaining.to_string());
        ctx.metadata.insert(
            META_RESET.to_string(),
            decision.reset_at.timestamp().to_string(),
        );
    }

    /// Copies the stored decision onto the response when this policy was the
    /// last one to admit the request.
    pub fn decorate(&self, ctx: &RequestContext, response: &mut Response<Body>) {
        if ctx.metadata.get(META_TYPE).map(String::as_str) != Some(self.kind.as_str()) {
            return;
        }

        let headers = response.headers_mut();
        for (meta, header) in [
            (META_LIMIT, "x-ratelimit-limit"),
            (META_REMAINING, "x-ratelimit-remaining"),
            (META_RESET, "x-ratelimit-reset"),
        ] {
            if let Some(value) = ctx.metadata.get(meta)
                && let Ok(value) = HeaderValue::from_str(value)
            {
                headers.insert(HeaderName::from_static(header), value);
            }
        }
        headers.insert(
            HeaderName::from_static("x-ratelimit-type"),
            HeaderValue::from_static(self.kind.as_str()),
        );
    }

    fn limited_response(&self, decision: &Decision) -> Response<Body> {
        let mut response = GatewayError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        }
        .into_response();
        write_headers(response.headers_mut(), self.kind, decision);
        response
    }
}

fn write_headers(headers: &mut HeaderMap, kind: PolicyKind, decision: &Decision) {
    let values = [
        ("x-ratelimit-limit", decision.limit.to_string()),
        ("x-ratelimit-remaining", decision.remaining.to_string()),
        ("x-ratelimit-reset", decision.reset_at.timestamp().to_string()),
    ];
    for (name, value) in values {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    }
    headers.insert(
        HeaderName::from_static("x-ratelimit-type"),
        HeaderValue::from_static(kind.as_str()),
    );
}
