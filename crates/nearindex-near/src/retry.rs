//! Exponential backoff with jitter, and a [`ChainClient`] decorator that
//! applies it together with a per-call deadline.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use nearindex_core::{BlockRef, ChainClient, Header, IndexerError, RawBlock, RetryConfig};

/// Stateless retry policy; computes the delay before each retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay before the `attempt`-th retry (1-based), `None` once
    /// `max_retries` is exceeded.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        let jitter = capped * self.config.jitter_fraction * jitter_factor();
        Some(Duration::from_millis((capped + jitter).max(0.0) as u64))
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }
}

/// Pseudo-random value in `[-1.0, 1.0)` from the clock's sub-second part.
fn jitter_factor() -> f64 {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 2_000) as f64 / 1_000.0 - 1.0
}

// ─── RetryingClient ──────────────────────────────────────────────────────────

/// Wraps a [`ChainClient`]: each call runs under `request_timeout` and
/// transient failures are retried according to the policy. Exhausted
/// retries return the last error.
pub struct RetryingClient<C> {
    inner: C,
    policy: RetryPolicy,
    request_timeout: Duration,
}

impl<C: ChainClient> RetryingClient<C> {
    pub fn new(inner: C, config: RetryConfig, request_timeout: Duration) -> Self {
        Self {
            inner,
            policy: RetryPolicy::new(config),
            request_timeout,
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, IndexerError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T, IndexerError>> + Send,
        T: Send,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.request_timeout, call()).await {
                Ok(result) => result,
                Err(_) => Err(IndexerError::Timeout {
                    ms: self.request_timeout.as_millis() as u64,
                }),
            };
            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => match self.policy.next_delay(attempt) {
                    Some(delay) => {
                        tracing::warn!(
                            op,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            kind = %e.kind(),
                            error = %e,
                            "retrying request"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        tracing::error!(op, attempt, kind = %e.kind(), error = %e, "max retries exceeded");
                        return Err(e);
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<C: ChainClient> ChainClient for RetryingClient<C> {
    async fn fetch_blocks(&self, heights: &[u64]) -> Result<Vec<Option<RawBlock>>, IndexerError> {
        self.with_retry("fetch_blocks", || self.inner.fetch_blocks(heights))
            .await
    }

    async fn get_header(&self, block: BlockRef) -> Result<Header, IndexerError> {
        self.with_retry("get_header", || self.inner.get_header(block.clone()))
            .await
    }

    async fn get_finalized_header(&self) -> Result<Header, IndexerError> {
        self.with_retry("get_finalized_header", || self.inner.get_finalized_header())
            .await
    }

    async fn get_best_height(&self) -> Result<u64, IndexerError> {
        self.with_retry("get_best_height", || self.inner.get_best_height())
            .await
    }

    async fn get_chain_id(&self) -> Result<String, IndexerError> {
        self.with_retry("get_chain_id", || self.inner.get_chain_id())
            .await
    }
}
