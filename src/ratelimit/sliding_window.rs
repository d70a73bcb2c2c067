//! Sliding-window admission decision.
//!
//! Counts every timestamp that falls inside `(now - window, now]`. There is no
//! bucket boundary: once a key is saturated, capacity returns one slot at a
//! time as individual timestamps age out.

use chrono::{DateTime, Utc};

use crate::{
    clock::to_delta,
    ratelimit::{AdmissionResult, Decision, LimitPolicy, RateLimitStore},
};

pub async fn evaluate(
    store: &dyn RateLimitStore,
    key: &str,
    policy: &LimitPolicy,
    now: DateTime<Utc>,
) -> AdmissionResult<Decision> {
    let window = to_delta(policy.window);
    let cutoff = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let count = store.get_request_count(key, cutoff).await?;
    let reset_at = now.checked_add_signed(window).unwrap_or(DateTime::<Utc>::MAX_UTC);

    if count < policy.limit {
        return Ok(Decision {
            allowed: true,
            limit: policy.limit,
            remaining: policy.limit.saturating_sub(count + 1),
            reset_at,
            retry_after: std::time::Duration::ZERO,
        });
    }

    let oldest = store
        .get_requests(key, cutoff)
        .await?
        .into_iter()
        .min();
    let retry_after = oldest
        .and_then(|t| t.checked_add_signed(window))
        .and_then(|freed_at| (freed_at - now).to_std().ok())
        .filter(|d| !d.is_zero())
        .unwrap_or(policy.window);

    Ok(Decision {
        allowed: false,
        limit: policy.limit,
        remaining: 0,
        reset_at,
        retry_after,
    })
}
