use std::{
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;

use crate::{
    clock::{Clock, to_delta},
    ratelimit::{AdmissionResult, RateLimitStore},
};

/// Prunes everything older than `retention` (the longest window any policy
/// uses) on a fixed interval, off the request path.
pub fn spawn_cleanup_task(
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match run_cleanup(store.as_ref(), clock.as_ref(), retention).await {
                Ok(removed) => {
                    tracing::debug!(removed_keys = removed, "rate limit store cleanup finished")
                }
                Err(err) => tracing::warn!(error = %err, "rate limit store cleanup failed"),
            }
        }
    })
}

pub async fn run_cleanup(
    store: &dyn RateLimitStore,
    clock: &dyn Clock,
    retention: Duration,
) -> AdmissionResult<usize> {
    let cutoff = clock
        .now()
        .checked_sub_signed(to_delta(retention))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    store.cleanup(cutoff).await
}
