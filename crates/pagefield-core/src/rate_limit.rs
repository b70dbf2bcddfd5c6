//! Retry policy, rate-limit classification and the optional adaptive throttle.
//!
//! The [`RetryPolicy`] drives the per-page backoff loop in
//! [`crate::page::PageExtractor`]. The [`AdaptiveLimiter`] is a proactive
//! governor placed in front of the model client: on every 429 it slows down,
//! and after a quiet minute it returns to the configured rate.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

use crate::model::FieldExtractor;
use crate::raster::PageImage;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Failure of a single model call, split by whether it is worth retrying.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExtractError {
    /// Server returned 429 Too Many Requests (or an equivalent quota error).
    #[error("rate limited (429){}", describe_retry(.retry_after))]
    RateLimited { retry_after: Option<Duration> },
    /// Any other error. Not retried.
    #[error("{0}")]
    Other(String),
}

fn describe_retry(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(", retry after {:.1}s", d.as_secs_f64()),
        None => String::new(),
    }
}

impl From<String> for ExtractError {
    fn from(s: String) -> Self {
        ExtractError::Other(s)
    }
}

impl From<reqwest::Error> for ExtractError {
    fn from(e: reqwest::Error) -> Self {
        ExtractError::Other(e.to_string())
    }
}

/// Bounded retry with exponential backoff and a per-page wall-clock budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: u32,
    /// Budget measured from the first attempt on a page.
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            backoff_base: 2,
            max_wait: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Sleep before the retry following failed attempt number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(u64::from(self.backoff_base).saturating_pow(attempt))
    }
}

/// Check if an HTTP response is a 429 and extract Retry-After if present.
pub fn check_rate_limit_response(resp: &reqwest::Response) -> Result<(), ExtractError> {
    if resp.status().as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        Err(ExtractError::RateLimited { retry_after })
    } else {
        Ok(())
    }
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date: fall back to a conservative fixed wait
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

/// Rate limiter whose governor is swapped for a slower one on every 429.
pub struct AdaptiveLimiter {
    limiter: ArcSwap<DirectLimiter>,
    base_period: Duration,
    /// 1 = configured rate, 2 = half rate, capped at 16.
    current_factor: AtomicU32,
    last_429: std::sync::Mutex<Option<Instant>>,
}

fn quota_for(period: Duration) -> Quota {
    Quota::with_period(period).unwrap_or_else(|| Quota::per_second(std::num::NonZeroU32::MIN))
}

impl AdaptiveLimiter {
    pub fn new(period: Duration) -> Self {
        let limiter = Arc::new(DirectLimiter::direct(quota_for(period)));
        Self {
            limiter: ArcSwap::from(limiter),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_429: std::sync::Mutex::new(None),
        }
    }

    /// Allow `n` requests per second.
    pub fn per_second(n: u32) -> Self {
        let ms = 1000 / n.max(1) as u64;
        Self::new(Duration::from_millis(ms.max(1)))
    }

    /// Wait for a permit.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }

        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(16))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor)
            && let Some(quota) = Quota::with_period(scaled)
        {
            self.limiter.store(Arc::new(DirectLimiter::direct(quota)));
            tracing::debug!(factor, "model throttle slowed");
        }
    }

    pub fn factor(&self) -> u32 {
        self.current_factor.load(Ordering::SeqCst)
    }

    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed().as_secs() >= 60))
            .unwrap_or(false);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            self.limiter
                .store(Arc::new(DirectLimiter::direct(quota_for(self.base_period))));
            tracing::debug!("model throttle restored");
        }
    }
}

/// Puts an [`AdaptiveLimiter`] in front of another extractor.
pub struct ThrottledExtractor<E> {
    inner: E,
    limiter: AdaptiveLimiter,
}

impl<E: FieldExtractor> ThrottledExtractor<E> {
    pub fn new(inner: E, limiter: AdaptiveLimiter) -> Self {
        Self { inner, limiter }
    }

    pub fn limiter(&self) -> &AdaptiveLimiter {
        &self.limiter
    }
}

impl<E: FieldExtractor> FieldExtractor for ThrottledExtractor<E> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn extract<'a>(
        &'a self,
        image: &'a PageImage,
        instructions: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<String, ExtractError>> + Send + 'a>> {
        Box::pin(async move {
            self.limiter.acquire().await;
            let result = self.inner.extract(image, instructions).await;
            if matches!(result, Err(ExtractError::RateLimited { .. })) {
                self.limiter.on_rate_limited();
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mock::{MockExtractor, MockResponse};

    // ── RetryPolicy ────────────────────────────────────────────────────

    #[test]
    fn backoff_is_exponential() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(16));
    }

    #[test]
    fn backoff_saturates() {
        let policy = RetryPolicy {
            backoff_base: 10,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(40), Duration::from_secs(u64::MAX));
    }

    // ── parse_retry_after ──────────────────────────────────────────────

    #[test]
    fn parse_integer_seconds() {
        assert_eq!(parse_retry_after("5"), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after(" 0 "), Some(Duration::from_secs(0)));
    }

    #[test]
    fn parse_http_date() {
        let val = "Wed, 21 Oct 2015 07:28:00 GMT";
        assert_eq!(parse_retry_after(val), Some(Duration::from_secs(5)));
    }

    #[test]
    fn parse_garbage_none() {
        assert_eq!(parse_retry_after("soon"), None);
    }

    // ── check_rate_limit_response ──────────────────────────────────────

    #[test]
    fn ok_on_200() {
        let http_resp = http::Response::builder().status(200).body("").unwrap();
        let resp = reqwest::Response::from(http_resp);
        assert!(check_rate_limit_response(&resp).is_ok());
    }

    #[test]
    fn rate_limited_429_with_retry_after() {
        let http_resp = http::Response::builder()
            .status(429)
            .header("retry-after", "10")
            .body("")
            .unwrap();
        let resp = reqwest::Response::from(http_resp);
        let err = check_rate_limit_response(&resp).unwrap_err();
        assert_eq!(
            err,
            ExtractError::RateLimited {
                retry_after: Some(Duration::from_secs(10))
            }
        );
        assert_eq!(err.to_string(), "rate limited (429), retry after 10.0s");
    }

    #[test]
    fn server_error_is_not_rate_limit() {
        let http_resp = http::Response::builder().status(500).body("").unwrap();
        let resp = reqwest::Response::from(http_resp);
        assert!(check_rate_limit_response(&resp).is_ok());
    }

    // ── AdaptiveLimiter ────────────────────────────────────────────────

    #[test]
    fn factor_doubles_and_caps() {
        let limiter = AdaptiveLimiter::per_second(10);
        assert_eq!(limiter.factor(), 1);
        limiter.on_rate_limited();
        assert_eq!(limiter.factor(), 2);
        for _ in 0..10 {
            limiter.on_rate_limited();
        }
        assert_eq!(limiter.factor(), 16);
    }

    #[tokio::test]
    async fn decay_restores_after_60s() {
        let limiter = AdaptiveLimiter::per_second(10);
        limiter.on_rate_limited();
        limiter.on_rate_limited();
        assert_eq!(limiter.factor(), 4);

        {
            let mut last = limiter.last_429.lock().unwrap();
            *last = Some(Instant::now() - Duration::from_secs(61));
        }

        limiter.acquire().await;
        assert_eq!(limiter.factor(), 1);
    }

    // ── ThrottledExtractor ─────────────────────────────────────────────

    #[tokio::test]
    async fn throttle_slows_on_429() {
        let mock = MockExtractor::new(MockResponse::RateLimited { retry_after: None });
        let throttled = ThrottledExtractor::new(mock, AdaptiveLimiter::per_second(100));
        let image = PageImage {
            number: 1,
            png: b"x:1".to_vec(),
        };

        let result = throttled.extract(&image, "fields").await;
        assert!(matches!(result, Err(ExtractError::RateLimited { .. })));
        assert_eq!(throttled.limiter().factor(), 2);
        assert_eq!(throttled.name(), "mock");
    }

    #[tokio::test]
    async fn throttle_passes_success_through() {
        let mock = MockExtractor::new(MockResponse::Text("[]".into()));
        let throttled = ThrottledExtractor::new(mock, AdaptiveLimiter::per_second(100));
        let image = PageImage {
            number: 1,
            png: b"x:1".to_vec(),
        };

        assert_eq!(throttled.extract(&image, "fields").await.unwrap(), "[]");
        assert_eq!(throttled.limiter().factor(), 1);
    }
}
