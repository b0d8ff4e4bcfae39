// src/connectors/retry.rs
use crate::config::RetryConfig;
use crate::error::{ErrorClass, ExchangeError, ExchangeResult};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub unknown_multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            unknown_multiplier: cfg.unknown_delay_multiplier.max(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before the retry that follows `attempt` (1-based), capped, before jitter.
    pub fn backoff(&self, attempt: u32, class: ErrorClass) -> Duration {
        let exp = 2u32.saturating_pow(attempt.saturating_sub(1));
        let mut delay = self.base_delay.saturating_mul(exp);
        if class == ErrorClass::Unknown {
            delay = delay.saturating_mul(self.unknown_multiplier);
        }
        delay.min(self.max_delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let spread = delay.as_millis() as u64 / 2;
        if spread == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

/// Runs `op` until it succeeds, fails with a trade fault, or the attempt budget is spent.
///
/// Every attempt is logged. A spent budget is reported as [`ExchangeError::Exhausted`]
/// wrapping the last failure, so an exhausted `unknown` surfaces as a trade fault.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> ExchangeResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ExchangeResult<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => {
                debug!(op = label, attempt, "exchange call ok");
                return Ok(value);
            }
            Err(err) => {
                let class = err.class();
                warn!(op = label, attempt, class = %class, error = %err, "exchange call failed");

                if !err.is_retryable() {
                    return Err(err);
                }
                if attempt >= policy.max_attempts {
                    return Err(ExchangeError::Exhausted {
                        attempts: attempt,
                        last: Box::new(err),
                    });
                }
                tokio::time::sleep(policy.jittered(policy.backoff(attempt, class))).await;
            }
        }
    }
}
