//! Retry with exponential backoff for transient store failures.

use std::time::Duration;

use futures::future::BoxFuture;
use kiln_core::StoreError;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_attempts: 5, base: Duration::from_millis(100), max: Duration::from_millis(5000) } }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            max_attempts: env_or("KILN_RETRY_MAX_ATTEMPTS", d.max_attempts).max(1),
            base: Duration::from_millis(env_or("KILN_BACKOFF_BASE_MS", d.base.as_millis() as u64)),
            max: Duration::from_millis(env_or("KILN_BACKOFF_MAX_MS", d.max.as_millis() as u64)),
        }
    }

    /// No sleeping between attempts; used by tests and offline simulation.
    pub fn immediate(max_attempts: u32) -> Self { Self { max_attempts: max_attempts.max(1), base: Duration::ZERO, max: Duration::ZERO } }

    /// Delay before attempt `attempt + 1`, doubling from `base` up to `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Run `op` until it succeeds, fails permanently or attempts run out.
    /// Conflicts retry right away with a fresh read; unavailability backs off.
    pub async fn run<'a, T>(&self, what: &str, mut op: impl FnMut() -> BoxFuture<'a, Result<T, StoreError>>) -> Result<T, StoreError> {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) if e.is_transient() && attempt + 1 < self.max_attempts => {
                    let wait = match e {
                        StoreError::Conflict(_) => Duration::ZERO,
                        _ => self.delay(attempt),
                    };
                    debug!(op = what, attempt, wait_ms = wait.as_millis() as u64, error = %e, "retry: transient store error");
                    metrics::counter!("kiln_store_retries_total", 1u64);
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
