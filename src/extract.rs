use std::net::IpAddr;

use crate::context::{Identity, RequestContext};

pub trait IpExtractor: Send + Sync {
    fn client_ip(&self, ctx: &RequestContext) -> Option<IpAddr>;
}

pub trait UserExtractor: Send + Sync {
    fn identity(&self, ctx: &RequestContext) -> Option<Identity>;
}

/// Socket peer address, unless the peer is a trusted proxy, in which case the
/// forwarding headers are consulted.
#[derive(Debug, Clone, Default)]
pub struct ProxyAwareIpExtractor {
    trusted_proxies: Vec<IpAddr>,
}

impl ProxyAwareIpExtractor {
    pub fn new(trusted_proxies: Vec<IpAddr>) -> Self {
        Self { trusted_proxies }
    }

    fn is_trusted(&self, ip: &IpAddr) -> bool {
        self.trusted_proxies.contains(ip)
    }

    fn header<'a>(ctx: &'a RequestContext, name: &str) -> Option<&'a str> {
        ctx.headers.get(name).and_then(|v| v.to_str().ok())
    }

    // walk right to left: the rightmost hop not added by our own proxies
    fn from_forwarded_for(&self, ctx: &RequestContext) -> Option<IpAddr> {
        Self::header(ctx, "x-forwarded-for")?
            .rsplit(',')
            .filter_map(|hop| hop.trim().parse::<IpAddr>().ok())
            .find(|ip| !self.is_trusted(ip))
    }

    fn from_real_ip(ctx: &RequestContext) -> Option<IpAddr> {
        Self::header(ctx, "x-real-ip")?.trim().parse().ok()
    }
}

impl IpExtractor for ProxyAwareIpExtractor {
    fn client_ip(&self, ctx: &RequestContext) -> Option<IpAddr> {
        let peer = ctx.peer_ip?;
        if !self.is_trusted(&peer) {
            return Some(peer);
        }

        self.from_forwarded_for(ctx)
            .or_else(|| Self::from_real_ip(ctx))
            .or(Some(peer))
    }
}

/// Reads the identity the auth middleware attached to the request.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContextIdentityExtractor;

impl UserExtractor for ContextIdentityExtractor {
    fn identity(&self, ctx: &RequestContext) -> Option<Identity> {
        ctx.identity.clone()
    }
}
