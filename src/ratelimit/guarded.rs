use std::{
    future::Future,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    circuit_breaker::{CircuitBreaker, CircuitState},
    ratelimit::{AdmissionError, AdmissionResult, RateLimitStore},
};

/// Store decorator that routes every call through the circuit breaker and
/// bounds it with a deadline.
pub struct GuardedStore {
    inner: Arc<dyn RateLimitStore>,
    breaker: Arc<CircuitBreaker>,
    op_timeout: Duration,
}

impl GuardedStore {
    pub fn new(
        inner: Arc<dyn RateLimitStore>,
        breaker: Arc<CircuitBreaker>,
        op_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            breaker,
            op_timeout,
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn call<T, F>(&self, op: F) -> AdmissionResult<T>
    where
        T: Send,
        F: Future<Output = AdmissionResult<T>> + Send,
    {
        let Some(permit) = self.breaker.try_acquire() else {
            return Err(AdmissionError::CircuitOpen);
        };

        // if this future is dropped mid-call the permit hands back its slot
        let outcome = match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(AdmissionError::Cancelled(self.op_timeout.as_millis() as u64)),
        };

        match &outcome {
            Ok(_) => permit.succeeded(),
            Err(_) => permit.failed(),
        }
        outcome
    }
}

#[async_trait]
impl RateLimitStore for GuardedStore {
    async fn add_request(&self, key: &str, at: DateTime<Utc>) -> AdmissionResult<()> {
        self.call(self.inner.add_request(key, at)).await
    }

    async fn get_requests(
        &self,
        key: &str,
        cutoff: DateTime<Utc>,
    ) -> AdmissionResult<Vec<DateTime<Utc>>> {
        self.call(self.inner.get_requests(key, cutoff)).await
    }

    async fn get_request_count(&self, key: &str, cutoff: DateTime<Utc>) -> AdmissionResult<u64> {
        self.call(self.inner.get_request_count(key, cutoff)).await
    }

    async fn cleanup(&self, cutoff: DateTime<Utc>) -> AdmissionResult<usize> {
        self.call(self.inner.cleanup(cutoff)).await
    }

    async fn key_count(&self) -> AdmissionResult<usize> {
        self.call(self.inner.key_count()).await
    }

    async fn memory_usage(&self) -> AdmissionResult<usize> {
        self.call(self.inner.memory_usage()).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{
        AtomicBool,
        AtomicUsize,
        Ordering,
    };

    use super::*;
    use crate::ratelimit::in_memory::InMemoryStore;

    /// In-memory store whose availability can be toggled, counting real calls.
    pub struct FlakyStore {
        inner: InMemoryStore,
        pub failing: AtomicBool,
        pub hang: AtomicBool,
        pub calls: AtomicUsize,
    }

    impl FlakyStore {
        pub fn new() -> Self {
            Self {
                inner: InMemoryStore::new(1_024),
                failing: AtomicBool::new(false),
                hang: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        async fn gate(&self) -> AdmissionResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(AdmissionError::Store("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl RateLimitStore for FlakyStore {
        async fn add_request(&self, key: &str, at: DateTime<Utc>) -> AdmissionResult<()> {
            self.gate().await?;
            self.inner.add_request(key, at).await
        }

        async fn get_requests(
            &self,
            key: &str,
            cutoff: DateTime<Utc>,
        ) -> AdmissionResult<Vec<DateTime<Utc>>> {
            self.gate().await?;
            self.inner.get_requests(key, cutoff).await
        }

        async fn get_request_count(
            &self,
            key: &str,
            cutoff: DateTime<Utc>,
        ) -> AdmissionResult<u64> {
            self.gate().await?;
            self.inner.get_request_count(key, cutoff).await
        }

        async fn cleanup(&self, cutoff: DateTime<Utc>) -> AdmissionResult<usize> {
            self.gate().await?;
            self.inner.cleanup(cutoff).await
        }

        async fn key_count(&self) -> AdmissionResult<usize> {
            self.gate().await?;
            self.inner.key_count().await
        }

        async fn memory_usage(&self) -> AdmissionResult<usize> {
            self.gate().await?;
            self.inner.memory_usage().await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::{testing::FlakyStore, *};
    use crate::{
        clock::{Clock, ManualClock},
        config::CircuitBreakerConfig,
    };

    fn guarded(store: Arc<FlakyStore>, clock: Arc<ManualClock>) -> GuardedStore {
        let breaker = Arc::new(CircuitBreaker::new(
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_timeout: Duration::from_secs(5),
                half_open_max_requests: 1,
            },
            clock,
        ));
        GuardedStore::new(store, breaker, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn open_circuit_skips_the_store() {
        let clock = Arc::new(ManualClock::starting_at_epoch_millis(0));
        let flaky = Arc::new(FlakyStore::new());
        let store = guarded(flaky.clone(), clock.clone());
        flaky.set_failing(true);

        for _ in 0..2 {
            let err = store.get_request_count("ip:1", clock.now()).await.unwrap_err();
            assert!(matches!(err, AdmissionError::Store(_)));
        }
        assert_eq!(store.breaker_state(), CircuitState::Open);

        let err = store.get_request_count("ip:1", clock.now()).await.unwrap_err();
        assert_eq!(err, AdmissionError::CircuitOpen);
        assert_eq!(flaky.calls(), 2);
    }

    #[tokio::test]
    async fn recovers_through_a_successful_half_open_call() {
        let clock = Arc::new(ManualClock::starting_at_epoch_millis(0));
        let flaky = Arc::new(FlakyStore::new());
        let store = guarded(flaky.clone(), clock.clone());
        flaky.set_failing(true);
        for _ in 0..2 {
            let _ = store.key_count().await;
        }

        flaky.set_failing(false);
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.key_count().await.unwrap(), 0);
        assert_eq!(store.breaker_state(), CircuitState::Closed);
        assert_eq!(flaky.calls(), 3);
    }

    #[tokio::test]
    async fn hung_store_call_is_cancelled_and_counted() {
        let clock = Arc::new(ManualClock::starting_at_epoch_millis(0));
        let flaky = Arc::new(FlakyStore::new());
        let store = guarded(flaky.clone(), clock.clone());
        flaky.hang.store(true, Ordering::SeqCst);

        let err = store.add_request("ip:1", clock.now()).await.unwrap_err();
        assert_eq!(err, AdmissionError::Cancelled(50));
        let _ = store.add_request("ip:1", clock.now()).await;
        assert_eq!(store.breaker_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn cancelled_half_open_call_does_not_wedge_the_circuit() {
        let clock = Arc::new(ManualClock::starting_at_epoch_millis(0));
        let flaky = Arc::new(FlakyStore::new());
        let store = guarded(flaky.clone(), clock.clone());
        flaky.set_failing(true);
        for _ in 0..2 {
            let _ = store.key_count().await;
        }
        assert_eq!(store.breaker_state(), CircuitState::Open);

        // the caller gives up on the half-open probe before the store answers
        clock.advance(Duration::from_secs(5));
        flaky.hang.store(true, Ordering::SeqCst);
        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), store.key_count()).await;
        assert!(abandoned.is_err());

        flaky.hang.store(false, Ordering::SeqCst);
        flaky.set_failing(false);
        assert_eq!(store.key_count().await.unwrap(), 0);
        assert_eq!(store.breaker_state(), CircuitState::Closed);
        assert_eq!(flaky.calls(), 4);
    }
}
