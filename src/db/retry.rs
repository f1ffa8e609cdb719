//! Caller-side retries with exponential backoff.
//!
//! Backends never retry on their own; wrap an operation in [`retry`] to
//! re-run it on transient failures (see [`DatabaseError::is_retryable`]).

use crate::config::RetryConfig;
use crate::db::context::Context;
use crate::error::{DatabaseError, DbResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Delay before retry number `attempt` (0-based), without jitter.
pub fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let factor = policy.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
    let secs = policy.initial_interval.as_secs_f64() * factor;
    let capped = secs.min(policy.max_interval.as_secs_f64());
    if capped.is_finite() && capped > 0.0 {
        Duration::from_secs_f64(capped)
    } else {
        policy.max_interval
    }
}

fn with_jitter(delay: Duration) -> Duration {
    let half = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
    if half == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=half))
}

/// Run `op` until it succeeds, fails with a non-retryable error or runs out
/// of attempts. When the context ends during a backoff sleep the context
/// error is returned. A disabled policy runs `op` once.
pub async fn retry<T, F, Fut>(ctx: &Context, policy: &RetryConfig, mut op: F) -> DbResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = DbResult<T>>,
{
    if !policy.enabled {
        return op().await;
    }

    let mut attempt = 0;
    loop {
        let err: DatabaseError = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if !err.is_retryable() || attempt >= policy.max_retries {
            return Err(err);
        }

        let mut delay = backoff_delay(policy, attempt);
        if policy.jitter {
            delay = with_jitter(delay);
        }
        debug!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after transient error"
        );
        ctx.sleep(delay).await?;
        attempt += 1;
    }
}
