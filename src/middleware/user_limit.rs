use std::{
    collections::HashMap,
    sync::Arc,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    response::Response,
};

use crate::{
    context::RequestContext,
    error::GatewayResult,
    extract::UserExtractor,
    middleware::{ControlFlow, GatewayMiddleware, rate_limit::AdmissionGate},
    ratelimit::LimitPolicy,
};

pub const ANONYMOUS_KEY: &str = "user:anonymous";

#[derive(Debug, Clone)]
pub struct TierLimits {
    pub default_policy: LimitPolicy,
    pub tiers: HashMap<String, LimitPolicy>,
}

impl TierLimits {
    pub fn resolve(&self, tier: &str) -> &LimitPolicy {
        self.tiers.get(tier).unwrap_or(&self.default_policy)
    }
}

pub struct UserRateLimitMiddleware {
    gate: AdmissionGate,
    limits: TierLimits,
    extractor: Arc<dyn UserExtractor>,
    skip_unauthenticated: bool,
    enabled: bool,
}

impl UserRateLimitMiddleware {
    pub fn new(
        gate: AdmissionGate,
        limits: TierLimits,
        extractor: Arc<dyn UserExtractor>,
        skip_unauthenticated: bool,
        enabled: bool,
    ) -> Self {
        Self {
            gate,
            limits,
            extractor,
            skip_unauthenticated,
            enabled,
        }
    }
}

#[async_trait]
impl GatewayMiddleware for UserRateLimitMiddleware {
    fn name(&self) -> &'static str {
        "user-rate-limit"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if !self.enabled {
            return Ok(ControlFlow::Continue);
        }

        // tier is resolved on every request so tier changes apply immediately
        let (key, policy) = match self.extractor.identity(ctx) {
            Some(identity) => (
                format!("user:{}", identity.user_id),
                *self.limits.resolve(&identity.tier),
            ),
            None if self.skip_unauthenticated => {
                self.gate.skip();
                return Ok(ControlFlow::Continue);
            }
            None => (ANONYMOUS_KEY.to_string(), self.limits.default_policy),
        };

        Ok(self.gate.admit(ctx, &key, &policy).await)
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
