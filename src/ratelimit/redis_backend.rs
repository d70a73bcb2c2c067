use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{
    Script,
    aio::ConnectionManager,
};
use uuid::Uuid;

use crate::ratelimit::{AdmissionResult, RateLimitStore};

// Index zset scores are a write sequence, so ZPOPMIN yields the least
// recently written keys.
const ADD_REQUEST_LUA: &str = r#"
local key = KEYS[1]
local index = KEYS[2]
local now_ms = tonumber(ARGV[1])
local member = ARGV[2]
local max_keys = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])
local logical = ARGV[5]
local prefix = ARGV[6]

local evicted = 0
if not redis.call('ZSCORE', index, logical) then
  local size = redis.call('ZCARD', index)
  if size >= max_keys then
    local victims = redis.call('ZPOPMIN', index, size - max_keys + 1)
    for i = 1, #victims, 2 do
      redis.call('DEL', prefix .. ':k:' .. victims[i])
      evicted = evicted + 1
    end
  end
end

local seq = redis.call('INCR', prefix .. ':seq')
redis.call('ZADD', key, now_ms, member)
redis.call('PEXPIRE', key, ttl_ms)
redis.call('ZADD', index, seq, logical)
return evicted
"#;

const CLEANUP_LUA: &str = r#"
local index = KEYS[1]
local cutoff_ms = ARGV[1]
local prefix = ARGV[2]

local removed = 0
local members = redis.call('ZRANGE', index, 0, -1)
for _, logical in ipairs(members) do
  local key = prefix .. ':k:' .. logical
  redis.call('ZREMRANGEBYSCORE', key, '-inf', cutoff_ms)
  if redis.call('ZCARD', key) == 0 then
    redis.call('DEL', key)
    redis.call('ZREM', index, logical)
    removed = removed + 1
  end
end
return removed
"#;

const MEMORY_LUA: &str = r#"
local index = KEYS[1]
local prefix = ARGV[1]

local total = redis.call('MEMORY', 'USAGE', index) or 0
local members = redis.call('ZRANGE', index, 0, -1)
for _, logical in ipairs(members) do
  total = total + (redis.call('MEMORY', 'USAGE', prefix .. ':k:' .. logical) or 0)
end
return total
"#;

/// Redis-backed ledger: one sorted set of epoch-millis per key plus an index
/// sorted set that tracks write recency for `max_keys` eviction.
pub struct RedisStore {
    manager: ConnectionManager,
    key_prefix: String,
    max_keys: usize,
    retention: Duration,
}

impl RedisStore {
    pub async fn new(
        url: String,
        key_prefix: String,
        max_keys: usize,
        retention: Duration,
    ) -> AdmissionResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self {
            manager,
            key_prefix,
            max_keys: max_keys.max(1),
            retention,
        })
    }

    fn data_key(&self, key: &str) -> String {
        format!("{}:k:{}", self.key_prefix, key)
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.key_prefix)
    }

    fn exclusive_min(cutoff: DateTime<Utc>) -> String {
        format!("({}", cutoff.timestamp_millis())
    }
}

fn parse_member(member: &str) -> Option<DateTime<Utc>> {
    let (millis, _) = member.split_once('-')?;
    DateTime::from_timestamp_millis(millis.parse().ok()?)
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn add_request(&self, key: &str, at: DateTime<Utc>) -> AdmissionResult<()> {
        let mut conn = self.manager.clone();
        let now_ms = at.timestamp_millis();
        let member = format!("{}-{}", now_ms, Uuid::new_v4());
        let ttl_ms = (self.retention.as_millis() as i64).max(1);

        let evicted: i64 = Script::new(ADD_REQUEST_LUA)
            .key(self.data_key(key))
            .key(self.index_key())
            .arg(now_ms)
            .arg(member)
            .arg(self.max_keys as i64)
            .arg(ttl_ms)
            .arg(key)
            .arg(&self.key_prefix)
            .invoke_async(&mut conn)
            .await?;

        if evicted > 0 {
            tracing::debug!(evicted, "evicted least recently used rate limit keys");
        }
        Ok(())
    }

    async fn get_requests(
        &self,
        key: &str,
        cutoff: DateTime<Utc>,
    ) -> AdmissionResult<Vec<DateTime<Utc>>> {
        let mut conn = self.manager.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(self.data_key(key))
            .arg(Self::exclusive_min(cutoff))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;

        Ok(members.iter().filter_map(|m| parse_member(m)).collect())
    }

    async fn get_request_count(&self, key: &str, cutoff: DateTime<Utc>) -> AdmissionResult<u64> {
        let mut conn = self.manager.clone();
        let count: u64 = redis::cmd("ZCOUNT")
            .arg(self.data_key(key))
            .arg(Self::exclusive_min(cutoff))
            .arg("+inf")
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> AdmissionResult<usize> {
        let mut conn = self.manager.clone();
        let removed: i64 = Script::new(CLEANUP_LUA)
            .key(self.index_key())
            .arg(cutoff.timestamp_millis())
            .arg(&self.key_prefix)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed.max(0) as usize)
    }

    async fn key_count(&self) -> AdmissionResult<usize> {
        let mut conn = self.manager.clone();
        let count: usize = redis::cmd("ZCARD")
            .arg(self.index_key())
            .query_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn memory_usage(&self) -> AdmissionResult<usize> {
        let mut conn = self.manager.clone();
        let bytes: i64 = Script::new(MEMORY_LUA)
            .key(self.index_key())
            .arg(&self.key_prefix)
            .invoke_async(&mut conn)
            .await?;
        Ok(bytes.max(0) as usize)
    }
}
