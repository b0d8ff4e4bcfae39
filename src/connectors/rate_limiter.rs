// src/connectors/rate_limiter.rs
use crate::error::{ExchangeError, ExchangeResult};
use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

type Spacing = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Shared request queue: at most `max_concurrent` calls in flight and at least
/// `min_interval` between consecutive request starts.
///
/// Every caller of one exchange account must go through the same queue.
pub struct RequestQueue {
    permits: Semaphore,
    // None when spacing is disabled (zero interval)
    spacing: Option<Spacing>,
}

impl RequestQueue {
    pub fn new(max_concurrent: usize, min_interval: Duration) -> Self {
        // with_period keeps a burst of one: a single request per interval
        let spacing = Quota::with_period(min_interval).map(RateLimiter::direct);
        Self {
            permits: Semaphore::new(max_concurrent.max(1)),
            spacing,
        }
    }

    /// Waits for a concurrency slot, then for the spacing window. Hold the permit for the request.
    pub async fn acquire(&self) -> ExchangeResult<SemaphorePermit<'_>> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ExchangeError::Unexpected("request queue closed".to_string()))?;

        if let Some(spacing) = &self.spacing {
            spacing.until_ready().await;
        }

        Ok(permit)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}
