use async_trait::async_trait;

use crate::{
    config::ApiKeyEntry,
    context::{Identity, RequestContext},
    error::{GatewayError, GatewayResult},
    middleware::{ControlFlow, GatewayMiddleware},
};

/// Resolves `x-api-key` into an [`Identity`]. Requests without a key carry on
/// anonymously; requests with an unknown key are rejected.
pub struct ApiKeyIdentityMiddleware {
    keys: Vec<(Vec<u8>, Identity)>,
    exempt_prefixes: Vec<String>,
}

impl ApiKeyIdentityMiddleware {
    pub fn new(entries: Vec<ApiKeyEntry>, exempt_prefixes: Vec<String>) -> Self {
        Self {
            keys: entries
                .into_iter()
                .map(|entry| {
                    (
                        entry.key.into_bytes(),
                        Identity {
                            user_id: entry.user_id,
                            tier: entry.tier,
                        },
                    )
                })
                .collect(),
            exempt_prefixes,
        }
    }

    fn is_exempt_path(&self, path: &str) -> bool {
        self.exempt_prefixes.iter().any(|prefix| path.starts_with(prefix))
    }

    fn lookup(&self, provided: &[u8]) -> Option<Identity> {
        // compare against every key so timing does not reveal the match
        let mut found = None;
        for (expected, identity) in &self.keys {
            if timing_safe_eq(expected, provided) && found.is_none() {
                found = Some(identity.clone());
            }
        }
        found
    }
}

#[async_trait]
impl GatewayMiddleware for ApiKeyIdentityMiddleware {
    fn name(&self) -> &'static str {
        "api-key-identity"
    }

    async fn on_request(&self, ctx: &mut RequestContext) -> GatewayResult<ControlFlow> {
        if self.is_exempt_path(ctx.uri.path()) {
            return Ok(ControlFlow::Continue);
        }

        let Some(provided) = ctx
            .headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
        else {
            return Ok(ControlFlow::Continue);
        };

        let identity = self
            .lookup(provided.as_bytes())
            .ok_or(GatewayError::Unauthorized)?;
        ctx.identity = Some(identity);
        Ok(ControlFlow::Continue)
    }
}

fn timing_safe_eq(a: &[u8], b: &[u8]) -> bool {
    let max = a.len().max(b.len());
    let mut diff = (a.len() ^ b.len()) as u8;

    for idx in 0..max {
        let av = *a.get(idx).unwrap_or(&0);
        let bv = *b.get(idx).unwrap_or(&0);
        diff |= av ^ bv;
    }

    diff == 0
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use http::{HeaderMap, HeaderValue, Method, Uri};

    use super::*;

    fn middleware() -> ApiKeyIdentityMiddleware {
        ApiKeyIdentityMiddleware::new(
            vec![ApiKeyEntry {
                key: "k-alice".to_string(),
                user_id: "alice".to_string(),
                tier: "basic".to_string(),
            }],
            vec!["/health".to_string()],
        )
    }

    fn request(path: &'static str, key: Option<&str>) -> RequestContext {
        let mut headers = HeaderMap::new();
        if let Some(key) = key {
            headers.insert("x-api-key", HeaderValue::from_str(key).unwrap());
        }
        RequestContext::new(
            "req".to_string(),
            Method::GET,
            Uri::from_static(path),
            headers,
            Bytes::new(),
            None,
        )
    }

    #[tokio::test]
    async fn known_key_attaches_identity() {
        let mut ctx = request("/orders", Some("k-alice"));
        middleware().on_request(&mut ctx).await.unwrap();
        assert_eq!(
            ctx.identity,
            Some(Identity {
                user_id: "alice".to_string(),
                tier: "basic".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn missing_key_is_anonymous_and_unknown_key_is_rejected() {
        let mut anonymous = request("/orders", None);
        middleware().on_request(&mut anonymous).await.unwrap();
        assert!(anonymous.identity.is_none());

        let mut forged = request("/orders", Some("k-alicf"));
        assert!(matches!(
            middleware().on_request(&mut forged).await,
            Err(GatewayError::Unauthorized)
        ));

        let mut exempt = request("/health", Some("whatever"));
        assert!(middleware().on_request(&mut exempt).await.is_ok());
    }

    #[test]
    fn timing_safe_eq_checks_length() {
        assert!(timing_safe_eq(b"abc", b"abc"));
        assert!(!timing_safe_eq(b"abc", b"abcd"));
        assert!(!timing_safe_eq(b"abc", b"abd"));
    }
}
