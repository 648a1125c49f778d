//! Staggered retries for a transport.
//!
//! ```
//! use cloudburst::QueryError;
//! use cloudburst::transport::BaseQueryApi;
//! use cloudburst::transport::retry::{RetryOptions, retry_staggered};
//! use serde_json::Value;
//!
//! let flaky = |_args: Value, _api: BaseQueryApi| async { Err::<Value, _>(QueryError::transport(503)) };
//! let transport = retry_staggered(flaky, RetryOptions::default().with_max_retries(2));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use serde_json::Value;

use super::{BaseQuery, BaseQueryApi, QueryReturnValue};
use crate::error::QueryError;

/// Exponential backoff with random jitter.
///
/// The delay before retry `n` is `base * 2^(n-1)` plus up to the same amount
/// again in jitter, capped at `max`. Delays never decrease from one retry to
/// the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first retry, before jitter.
    pub base: Duration,
    /// Upper bound of any delay, jitter included.
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(300),
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before retry number `attempt` (starting at 1), given the delay
    /// used before the previous retry.
    #[must_use]
    pub fn delay(&self, attempt: u32, previous: Duration) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let term = self.base.saturating_mul(1 << exponent).min(self.max);
        let jitter = term.mul_f64(rand::rng().random::<f64>());
        term.saturating_add(jitter).min(self.max).max(previous)
    }
}

type RetryIf = Arc<dyn Fn(&QueryError, u32) -> bool + Send + Sync>;

/// Retry policy.
#[derive(Clone)]
pub struct RetryOptions {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delays between attempts.
    pub backoff: Backoff,
    retry_if: RetryIf,
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Backoff::default(),
            retry_if: Arc::new(|error: &QueryError, _: u32| is_retryable(error)),
        }
    }
}

impl RetryOptions {
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Decides per failure (and retry number) whether to try again.
    #[must_use]
    pub fn with_retry_if(mut self, retry_if: impl Fn(&QueryError, u32) -> bool + Send + Sync + 'static) -> Self {
        self.retry_if = Arc::new(retry_if);
        self
    }
}

/// Errors that a second attempt cannot fix are not retried by default.
#[must_use]
pub const fn is_retryable(error: &QueryError) -> bool {
    !matches!(
        error,
        QueryError::Aborted | QueryError::Serialization(_) | QueryError::MalformedResult(_)
    )
}

/// A transport wrapped by [`retry_staggered`].
pub struct RetryStaggered<B> {
    inner: Arc<B>,
    options: Arc<RetryOptions>,
}

impl<B> fmt::Debug for RetryStaggered<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryStaggered")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

/// Wraps `inner` so failing calls are retried according to `options`.
pub fn retry_staggered<B: BaseQuery>(inner: B, options: RetryOptions) -> RetryStaggered<B> {
    RetryStaggered {
        inner: Arc::new(inner),
        options: Arc::new(options),
    }
}

impl<B: BaseQuery> BaseQuery for RetryStaggered<B> {
    fn call(&self, args: Value, api: BaseQueryApi) -> BoxFuture<'static, QueryReturnValue> {
        let inner = Arc::clone(&self.inner);
        let options = Arc::clone(&self.options);
        async move {
            let mut retries = 0;
            let mut previous = Duration::ZERO;
            loop {
                let error = match inner.call(args.clone(), api.clone()).await {
                    Ok(value) => return Ok(value),
                    Err(error) => error,
                };
                retries += 1;
                if retries > options.max_retries || !(options.retry_if)(&error, retries) {
                    return Err(error);
                }

                let delay = options.backoff.delay(retries, previous);
                previous = delay;
                tracing::debug!(
                    endpoint = api.endpoint(),
                    retry = retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "Retrying failed request"
                );
                tokio::select! {
                    biased;
                    () = api.signal().cancelled() => return Err(QueryError::Aborted),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
        .boxed()
    }
}
