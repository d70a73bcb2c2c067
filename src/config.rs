use anyhow::{Context, Result, anyhow};
use std::{
    collections::HashMap,
    env,
    net::{IpAddr, SocketAddr},
    str::FromStr,
    time::Duration,
};

use crate::ratelimit::{LimitPolicy, MAX_WINDOW};

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    pub upstream: Option<UpstreamConfig>,
    pub api_keys: Vec<ApiKeyEntry>,
    pub auth_exempt_prefixes: Vec<String>,
    pub max_body_bytes: usize,
    pub ip_rate_limit: IpRateLimitConfig,
    pub user_rate_limit: UserRateLimitConfig,
    pub store: StoreConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyEntry {
    pub key: String,
    pub user_id: String,
    pub tier: String,
}

#[derive(Debug, Clone)]
pub struct IpRateLimitConfig {
    pub enabled: bool,
    pub policy: LimitPolicy,
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone)]
pub struct UserRateLimitConfig {
    pub enabled: bool,
    pub default_policy: LimitPolicy,
    pub tier_limits: HashMap<String, LimitPolicy>,
    pub skip_unauthenticated: bool,
}

#[derive(Debug, Clone)]
pub enum StoreBackendConfig {
    InMemory,
    Redis { url: String, key_prefix: String },
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub backend: StoreBackendConfig,
    pub max_keys: usize,
    pub op_timeout: Duration,
    pub cleanup_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let bind_addr = env
            .string("BIND_ADDR", "0.0.0.0:8080")
            .parse::<SocketAddr>()
            .context("invalid BIND_ADDR")?;

        let log_format = match env.string("LOG_FORMAT", "compact").to_ascii_lowercase().as_str() {
            "compact" | "text" => LogFormat::Compact,
            "json" => LogFormat::Json,
            other => return Err(anyhow!("unsupported LOG_FORMAT: {other}")),
        };

        let upstream = env
            .get("UPSTREAM_URL")
            .map(|url| url.trim().trim_end_matches('/').to_string())
            .filter(|url| !url.is_empty())
            .map(|base_url| UpstreamConfig {
                base_url,
                timeout: Duration::from_millis(env.parse("UPSTREAM_TIMEOUT_MS", 3_000u64).max(100)),
            });

        let api_keys = parse_api_keys(&env.string("API_KEYS", ""))?;
        let auth_exempt_prefixes = env.csv("AUTH_EXEMPT_PREFIXES", "/health,/metrics");

        let ip_rate_limit = IpRateLimitConfig {
            enabled: env.parse("IP_RATE_LIMIT_ENABLED", true),
            policy: LimitPolicy::new(
                env.required("IP_RATE_LIMIT", 100u64)?,
                Duration::from_millis(env.required("IP_RATE_LIMIT_WINDOW_MS", 60_000u64)?),
            )
            .context("invalid IP rate limit")?,
            trusted_proxies: env
                .csv("TRUSTED_PROXIES", "")
                .iter()
                .map(|raw| {
                    raw.parse::<IpAddr>()
                        .with_context(|| format!("invalid TRUSTED_PROXIES entry: {raw}"))
                })
                .collect::<Result<Vec<_>>>()?,
        };

        let user_rate_limit = UserRateLimitConfig {
            enabled: env.parse("USER_RATE_LIMIT_ENABLED", true),
            default_policy: LimitPolicy::new(
                env.required("USER_DEFAULT_LIMIT", 60u64)?,
                Duration::from_millis(env.required("USER_DEFAULT_WINDOW_MS", 60_000u64)?),
            )
            .context("invalid default user rate limit")?,
            tier_limits: parse_tier_limits(
                &env.string("USER_TIER_LIMITS", "admin=600@60000,basic=60@60000"),
            )?,
            skip_unauthenticated: env.parse("SKIP_UNAUTHENTICATED", true),
        };

        let backend = match env.string("STORE_BACKEND", "memory").to_ascii_lowercase().as_str() {
            "memory" | "in_memory" => StoreBackendConfig::InMemory,
            "redis" => StoreBackendConfig::Redis {
                url: env.string("REDIS_URL", "redis://127.0.0.1:6379"),
                key_prefix: env.string("REDIS_KEY_PREFIX", "admission:ratelimit"),
            },
            other => return Err(anyhow!("unsupported STORE_BACKEND: {other}")),
        };

        let store = StoreConfig {
            backend,
            max_keys: env.parse("STORE_MAX_KEYS", 100_000usize).max(1),
            op_timeout: Duration::from_millis(env.parse("STORE_OP_TIMEOUT_MS", 50u64).max(1)),
            cleanup_interval: Duration::from_millis(
                env.parse("STORE_CLEANUP_INTERVAL_MS", 60_000u64).max(100),
            ),
        };

        let recovery_timeout =
            Duration::from_millis(env.required("CB_RECOVERY_TIMEOUT_MS", 30_000u64)?);
        if recovery_timeout > MAX_WINDOW {
            return Err(anyhow!(
                "CB_RECOVERY_TIMEOUT_MS exceeds the {}s maximum",
                MAX_WINDOW.as_secs()
            ));
        }

        let circuit_breaker = CircuitBreakerConfig {
            failure_threshold: env.parse("CB_FAILURE_THRESHOLD", 5u32).max(1),
            recovery_timeout,
            half_open_max_requests: env.parse("CB_HALF_OPEN_MAX", 1u32).max(1),
        };

        Ok(Self {
            bind_addr,
            log_level: env.string("LOG_LEVEL", "info"),
            log_format,
            upstream,
            api_keys,
            auth_exempt_prefixes,
            max_body_bytes: env.parse("MAX_BODY_BYTES", 1_048_576usize),
            ip_rate_limit,
            user_rate_limit,
            store,
            circuit_breaker,
        })
    }

    /// Longest window any enabled policy counts over; cleanup must keep at
    /// least this much history.
    pub fn retention(&self) -> Duration {
        let ip = self
            .ip_rate_limit
            .enabled
            .then_some(self.ip_rate_limit.policy.window);
        let user = self.user_rate_limit.enabled.then(|| {
            self.user_rate_limit
                .tier_limits
                .values()
                .map(|p| p.window)
                .chain(std::iter::once(self.user_rate_limit.default_policy.window))
                .max()
                .unwrap_or(self.user_rate_limit.default_policy.window)
        });

        ip.into_iter()
            .chain(user)
            .max()
            .unwrap_or(self.ip_rate_limit.policy.window)
    }
}

struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn csv(&self, key: &str, default: &str) -> Vec<String> {
        self.string(key, default)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    /// Like `parse`, but a value that is present and malformed is an error.
    fn required<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow!("invalid {key}={raw:?}: {e}")),
        }
    }

    fn parse<T>(&self, key: &str, default: T) -> T
    where
        T: FromStr,
    {
        self.get(key)
            .and_then(|s| s.trim().parse::<T>().ok())
            .unwrap_or(default)
    }
}

/// `user:tier:key` entries, comma separated.
fn parse_api_keys(raw: &str) -> Result<Vec<ApiKeyEntry>> {
    let mut out = Vec::new();
    for chunk in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let mut parts = chunk.splitn(3, ':').map(str::trim);
        let (Some(user_id), Some(tier), Some(key)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(anyhow!("invalid API_KEYS entry (want user:tier:key): {chunk}"));
        };
        if user_id.is_empty() || tier.is_empty() || key.is_empty() {
            return Err(anyhow!("invalid API_KEYS entry (empty field): {chunk}"));
        }
        out.push(ApiKeyEntry {
            key: key.to_string(),
            user_id: user_id.to_string(),
            tier: tier.to_string(),
        });
    }
    Ok(out)
}

/// `tier=limit@window_ms` entries, comma separated.
fn parse_tier_limits(raw: &str) -> Result<HashMap<String, LimitPolicy>> {
    let mut out = HashMap::new();
    for chunk in raw.split(',').map(str::trim).filter(|c| !c.is_empty()) {
        let (tier, quota) = chunk
            .split_once('=')
            .map(|(t, s)| (t.trim(), s.trim()))
            .filter(|(t, _)| !t.is_empty())
            .ok_or_else(|| anyhow!("invalid USER_TIER_LIMITS entry: {chunk}"))?;
        let (limit, window_ms) = quota
            .split_once('@')
            .ok_or_else(|| anyhow!("tier {tier} needs limit@window_ms"))?;
        let limit = limit
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid limit for tier {tier}"))?;
        let window_ms = window_ms
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid window for tier {tier}"))?;
        let policy = LimitPolicy::new(limit, Duration::from_millis(window_ms))
            .with_context(|| format!("invalid rate limit for tier {tier}"))?;
        out.insert(tier.to_string(), policy);
    }
    Ok(out)
}
