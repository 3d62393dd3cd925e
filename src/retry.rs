//! Retry and backoff
//!
//! [`Retry`] wraps a provider call and retries it while the error code is in
//! an allow-list, sleeping for an exponentially growing jittered delay.
//! [`universal_retry`] handles bulk tagging APIs that report per-item
//! failures inside a successful response.

use crate::error::{Error, Result};
use crate::provider::{ProviderError, DEFAULT_THROTTLING_CODES};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Default attempt ceiling for [`Retry`]
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Attempt ceiling for bulk tagging calls
pub const TAG_MAX_ATTEMPTS: usize = 6;

/// Smallest first backoff delay, in seconds
const MIN_BACKOFF_SECS: f64 = 0.001;

/// Error code the tagging API uses for per-item throttles
const TAG_THROTTLE_CODE: &str = "ThrottlingException";

/// Where backoff waits happen
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

/// Sleeps on the tokio timer
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// Exponential delays from `start` up to `stop` seconds
///
/// With jitter each delay is drawn uniformly from `(0, current]`.
pub fn backoff_delays(start: f64, stop: f64, factor: f64, jitter: bool) -> impl Iterator<Item = Duration> {
    let mut current = start;
    std::iter::from_fn(move || {
        if current > stop || current <= 0.0 {
            return None;
        }
        let delay = if jitter {
            current - current * rand::random::<f64>()
        } else {
            current
        };
        current *= factor;
        Some(Duration::from_secs_f64(delay))
    })
}

/// Retry policy for provider calls
#[derive(Clone)]
pub struct Retry {
    codes: Vec<String>,
    max_attempts: u32,
    min_delay: f64,
    sleeper: Arc<dyn Sleeper>,
}

impl fmt::Debug for Retry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Retry")
            .field("codes", &self.codes)
            .field("max_attempts", &self.max_attempts)
            .field("min_delay", &self.min_delay)
            .finish()
    }
}

impl Default for Retry {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLING_CODES.iter().copied())
    }
}

impl Retry {
    /// Retry on any of `codes`
    pub fn new<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            codes: codes.into_iter().map(Into::into).collect(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            min_delay: 1.0,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_min_delay(mut self, min_delay: Duration) -> Self {
        // A zero start would end the backoff sequence before the first retry
        self.min_delay = min_delay.as_secs_f64().max(MIN_BACKOFF_SECS);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn codes(&self) -> &[String] {
        &self.codes
    }

    pub fn sleeper(&self) -> Arc<dyn Sleeper> {
        self.sleeper.clone()
    }

    /// Run `op`, retrying on allow-listed error codes
    pub async fn call<T, F, Fut>(&self, mut op: F) -> std::result::Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, ProviderError>>,
    {
        let max_delay = self.min_delay.max(2.0).powi(self.max_attempts as i32);
        let mut delays = backoff_delays(self.min_delay, max_delay, 2.0, true);
        let mut attempt = 0;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            attempt += 1;

            if !err.is_any(&self.codes) || attempt >= self.max_attempts {
                return Err(err);
            }
            let Some(delay) = delays.next() else {
                return Err(err);
            };

            tracing::debug!(
                "retrying after {} (attempt {}/{}), sleeping {:?}",
                err.code,
                attempt,
                self.max_attempts,
                delay
            );
            self.sleeper.sleep(delay).await;
        }
    }
}

/// Retry a bulk tagging call on per-item throttles
///
/// `method` receives the ARNs to act on and returns the raw response. A
/// response may embed `FailedResourcesMap` keyed by ARN; throttled items are
/// retried alone after a jittered delay, any other failure aborts at once.
/// Only the last response is returned when a retry happened.
pub async fn universal_retry<F, Fut>(sleeper: &dyn Sleeper, mut method: F, arns: Vec<String>) -> Result<Value>
where
    F: FnMut(Vec<String>) -> Fut,
    Fut: Future<Output = std::result::Result<Value, ProviderError>>,
{
    let mut arns = arns;

    for (idx, delay) in backoff_delays(1.5, 256.0, 2.0, true).enumerate() {
        let response = method(arns.clone()).await?;

        let failures = response
            .get("FailedResourcesMap")
            .and_then(|v| v.as_object())
            .filter(|map| !map.is_empty())
            .cloned();
        let Some(failures) = failures else {
            return Ok(response);
        };

        let mut errors = BTreeMap::new();
        let mut throttles = Vec::new();
        for (arn, failure) in &failures {
            let code = failure
                .get("ErrorCode")
                .and_then(|v| v.as_str())
                .unwrap_or("Unknown");
            if code == TAG_THROTTLE_CODE {
                throttles.push(arn.clone());
            } else {
                errors.insert(arn.clone(), code.to_string());
            }
        }

        if !errors.is_empty() {
            return Err(Error::TagErrors { errors });
        }

        if idx + 1 >= TAG_MAX_ATTEMPTS {
            return Err(Error::TagThrottled { arns: throttles });
        }

        tracing::debug!("{} resources throttled while tagging, retrying", throttles.len());
        sleeper.sleep(delay).await;
        arns = throttles;
    }

    Err(Error::TagThrottled { arns })
}
