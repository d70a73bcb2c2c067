pub mod cleanup;
pub mod error;
pub mod guarded;
pub mod in_memory;
pub mod redis_backend;
pub mod sliding_window;

use std::{
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use error::{AdmissionError, AdmissionResult};

use crate::clock::Clock;

/// Ledger of recent request timestamps per key.
///
/// Implementations must linearize writes to the same key and must not
/// serialize unrelated keys behind a single lock.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    async fn add_request(&self, key: &str, at: DateTime<Utc>) -> AdmissionResult<()>;

    /// Timestamps strictly after `cutoff`, in no particular order.
    async fn get_requests(
        &self,
        key: &str,
        cutoff: DateTime<Utc>,
    ) -> AdmissionResult<Vec<DateTime<Utc>>>;

    /// Same count as `get_requests(key, cutoff).len()`.
    async fn get_request_count(&self, key: &str, cutoff: DateTime<Utc>) -> AdmissionResult<u64>;

    /// Drops timestamps at or before `cutoff` and any key left empty.
    /// Returns the number of keys removed.
    async fn cleanup(&self, cutoff: DateTime<Utc>) -> AdmissionResult<usize>;

    async fn key_count(&self) -> AdmissionResult<usize>;

    /// Approximate resident bytes.
    async fn memory_usage(&self) -> AdmissionResult<usize>;
}

/// Longest window a policy may use. Keeps `now ± window` well inside the
/// range `DateTime<Utc>` can represent.
pub const MAX_WINDOW: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitPolicy {
    pub limit: u64,
    pub window: Duration,
}

impl LimitPolicy {
    pub fn new(limit: u64, window: Duration) -> AdmissionResult<Self> {
        if limit == 0 {
            return Err(AdmissionError::InvalidConfig(
                "limit must be a positive integer".to_string(),
            ));
        }
        if window.is_zero() {
            return Err(AdmissionError::InvalidConfig(
                "window must be longer than zero".to_string(),
            ));
        }
        if window > MAX_WINDOW {
            return Err(AdmissionError::InvalidConfig(format!(
                "window of {}s exceeds the {}s maximum",
                window.as_secs(),
                MAX_WINDOW.as_secs()
            )));
        }
        Ok(Self { limit, window })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
    pub retry_after: Duration,
}

impl Decision {
    /// Whole seconds for `Retry-After`, never zero on a denial.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        let rounded = if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        };
        rounded.max(1)
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Decides and, when admitted, records the request.
    pub async fn check(&self, key: &str, policy: &LimitPolicy) -> AdmissionResult<Decision> {
        let now = self.clock.now();
        let decision = sliding_window::evaluate(self.store.as_ref(), key, policy, now).await?;
        if decision.allowed {
            self.store.add_request(key, now).await?;
        }
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        ratelimit::in_memory::InMemoryStore,
    };

    #[test]
    fn rejects_zero_limit_and_window() {
        assert!(matches!(
            LimitPolicy::new(0, Duration::from_secs(1)),
            Err(AdmissionError::InvalidConfig(_))
        ));
        assert!(matches!(
            LimitPolicy::new(5, Duration::ZERO),
            Err(AdmissionError::InvalidConfig(_))
        ));
        assert!(LimitPolicy::new(1, Duration::from_millis(1)).is_ok());
        assert!(LimitPolicy::new(1, MAX_WINDOW).is_ok());
        assert!(matches!(
            LimitPolicy::new(1, Duration::from_millis(u64::MAX)),
            Err(AdmissionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn retry_after_rounds_up_to_whole_seconds() {
        let mut decision = Decision {
            allowed: false,
            limit: 1,
            remaining: 0,
            reset_at: DateTime::UNIX_EPOCH,
            retry_after: Duration::from_millis(1_200),
        };
        assert_eq!(decision.retry_after_secs(), 2);

        decision.retry_after = Duration::from_millis(40);
        assert_eq!(decision.retry_after_secs(), 1);

        decision.retry_after = Duration::from_secs(3);
        assert_eq!(decision.retry_after_secs(), 3);
    }

    #[tokio::test]
    async fn limiter_records_only_admitted_requests() {
        let clock = Arc::new(ManualClock::starting_at_epoch_millis(10_000));
        let store = Arc::new(InMemoryStore::new(100));
        let limiter = RateLimiter::new(store.clone(), clock.clone());
        let policy = LimitPolicy::new(2, Duration::from_secs(1)).unwrap();

        for _ in 0..5 {
            limiter.check("ip:10.0.0.1", &policy).await.unwrap();
        }

        let recorded = store
            .get_request_count("ip:10.0.0.1", DateTime::UNIX_EPOCH)
            .await
            .unwrap();
        assert_eq!(recorded, 2);
    }
}
