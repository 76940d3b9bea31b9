use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use parley_core::errors::EnrichError;

use crate::backend::EnrichmentBackend;

/// Bounded retry with exponential backoff + jitter. Covers transient
/// "model warming up" and overload responses; fatal errors pass through
/// immediately.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a retry attempt using exponential backoff + jitter.
    pub fn delay(&self, attempt: u32, suggested: Option<Duration>) -> Duration {
        // Respect server-suggested delay if provided
        if let Some(delay) = suggested {
            return delay;
        }

        // Exponential backoff: base * 2^attempt
        let exp_delay = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let capped = exp_delay.min(self.max_delay.as_millis() as f64);

        // Add jitter: delay * (1 ± jitter_factor)
        let jitter_range = capped * self.jitter_factor;
        let jitter = (random_u64() % (jitter_range as u64 * 2 + 1)) as f64 - jitter_range;
        let final_ms = (capped + jitter).max(10.0);

        Duration::from_millis(final_ms as u64)
    }
}

/// Simple non-cryptographic random u64 using thread-local state.
fn random_u64() -> u64 {
    use std::cell::Cell;
    use std::time::SystemTime;

    thread_local! {
        static STATE: Cell<u64> = Cell::new(
            SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos() as u64
        );
    }

    STATE.with(|s| {
        // xorshift64
        let mut x = s.get();
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        s.set(x);
        x
    })
}

/// Wraps an EnrichmentBackend with the retry policy. Callers above this
/// layer only ever see the final result or the last error.
pub struct RetryingBackend<B> {
    inner: B,
    policy: RetryPolicy,
    total_retries: AtomicU64,
}

impl<B: EnrichmentBackend> RetryingBackend<B> {
    pub fn new(inner: B, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            total_retries: AtomicU64::new(0),
        }
    }

    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<B: EnrichmentBackend> EnrichmentBackend for RetryingBackend<B> {
    async fn infer(
        &self,
        model: &str,
        payload: &serde_json::Value,
    ) -> Result<serde_json::Value, EnrichError> {
        let mut last_error: Option<EnrichError> = None;

        for attempt in 0..=self.policy.max_attempts {
            match self.inner.infer(model, payload).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if e.is_fatal() || !e.is_retryable() || attempt == self.policy.max_attempts {
                        return Err(e);
                    }

                    let delay = self.policy.delay(attempt, e.suggested_delay());
                    self.total_retries.fetch_add(1, Ordering::Relaxed);

                    warn!(
                        model,
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "retrying after error"
                    );

                    last_error = Some(e);
                    tokio::time::sleep(delay).await;
                }
            }
        }

        Err(last_error.unwrap_or(EnrichError::NetworkError("max retries exceeded".into())))
    }
}
