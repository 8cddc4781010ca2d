use std::future::Future;
use std::time::Duration;

use log::warn;
use rand::Rng;

use crate::agent::errors::Result;

/// Bounded retry with randomized backoff.
///
/// Every external interaction (git fetches, registry lookups, deployment API
/// calls) goes through one of these. The jitter spreads retries out so a
/// shared-cause failure does not hammer the remote in lockstep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, min_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            min_delay,
            max_delay,
        }
    }

    /// Policy wrapped around a whole watcher check.
    pub const fn watcher() -> Self {
        Self::new(5, Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Policy for individual deployment API requests.
    pub const fn request() -> Self {
        Self::new(5, Duration::from_secs(3), Duration::from_secs(13))
    }

    /// Boot-time dependency wait. More attempts than the steady-state
    /// policies since this only ever runs once per process.
    pub const fn boot() -> Self {
        Self::new(10, Duration::from_secs(2), Duration::from_secs(2))
    }

    /// A random delay in `[min_delay, max_delay]`.
    pub fn jittered_delay(&self) -> Duration {
        if self.min_delay >= self.max_delay {
            return self.min_delay;
        }
        let mut rng = rand::thread_rng();
        let secs = rng.gen_range(self.min_delay.as_secs_f64()..=self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Run `op` until it succeeds, the attempt cap is reached, or it fails with a
/// non-retryable error. The last error is returned unchanged so callers can
/// still match on its kind.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.jittered_delay();
                warn!(
                    "{what} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
