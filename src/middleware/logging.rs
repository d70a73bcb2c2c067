use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
    middleware::{
        ControlFlow,
        GatewayMiddleware,
        rate_limit::{META_OUTCOME, META_POLICY, META_REMAINING},
    },
};

/// First in the chain, so its response hook runs last and sees every
/// admission decision made for the request.
pub struct RequestLoggingMiddleware;

fn meta<'a>(ctx: &'a RequestContext, key: &str) -> Option<&'a str> {
    ctx.metadata.get(key).map(String::as_str)
}

#[async_trait]
impl GatewayMiddleware for RequestLoggingMiddleware {
    fn name(&self) -> &'static str {
        "request-logging"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        tracing::debug!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            peer_ip = ?ctx.peer_ip,
            "admission check started"
        );
        Ok(ControlFlow::Continue)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        let status = response.status();
        let outcome = meta(ctx, META_OUTCOME).unwrap_or("unchecked");

        if outcome == "degraded" {
            tracing::warn!(
                request_id = %ctx.request_id,
                path = %ctx.uri.path(),
                status = status.as_u16(),
                policy = meta(ctx, META_POLICY),
                outcome,
                latency_ms = ctx.started_at.elapsed().as_millis() as u64,
                "request admitted while the rate limiter was degraded"
            );
            return Ok(());
        }

        tracing::info!(
            request_id = %ctx.request_id,
            method = %ctx.method,
            path = %ctx.uri.path(),
            status = status.as_u16(),
            user = ctx.identity.as_ref().map(|i| i.user_id.as_str()),
            policy = meta(ctx, META_POLICY),
            outcome,
            remaining = meta(ctx, META_REMAINING),
            latency_ms = ctx.started_at.elapsed().as_millis() as u64,
            "request completed"
        );
        Ok(())
    }
}
