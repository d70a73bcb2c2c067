use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
    extract::IpExtractor,
    middleware::{ControlFlow, GatewayMiddleware, rate_limit::AdmissionGate},
    ratelimit::LimitPolicy,
};

pub struct IpRateLimitMiddleware {
    gate: AdmissionGate,
    policy: LimitPolicy,
    extractor: Arc<dyn IpExtractor>,
    enabled: bool,
}

impl IpRateLimitMiddleware {
    pub fn new(
        gate: AdmissionGate,
        policy: LimitPolicy,
        extractor: Arc<dyn IpExtractor>,
        enabled: bool,
    ) -> Self {
        Self {
            gate,
            policy,
            extractor,
            enabled,
        }
    }

    fn resolve_key(&self, ctx: &RequestContext) -> String {
        match self.extractor.client_ip(ctx) {
            Some(ip) => format!("ip:{ip}"),
            None => "ip:unknown".to_string(),
        }
    }
}

#[async_trait]
impl GatewayMiddleware for IpRateLimitMiddleware {
    fn name(&self) -> &'static str {
        "ip-rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if !self.enabled {
            return Ok(ControlFlow::Continue);
        }

        let key = self.resolve_key(ctx);
        Ok(self.gate.admit(ctx, &key, &self.policy).await)
    }

    async fn on_response(
        &self,
        ctx: &RequestContext,
        response: &mut Response<Body>,
    ) -> GatewayResult<()> {
        self.gate.decorate(ctx, response);
        Ok(())
    }
}
