//! Per-page extraction with bounded retry.
//!
//! Each page is driven by a [`PageMachine`]:
//!
//! ```text
//! Pending -> Retrying(attempt) -> { Succeeded | Skipped }
//! ```
//!
//! The machine owns every retry decision and holds no clock or network
//! handle, so its transitions can be tested directly. [`PageExtractor`] wraps
//! it with the model call, the sleeps and the wall-clock budget.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::model::FieldExtractor;
use crate::raster::PageImage;
use crate::rate_limit::{ExtractError, RetryPolicy};

pub type Fields = Map<String, Value>;

/// Why a page produced no records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The page budget ran out.
    Timeout,
    /// Rate limited on every allowed attempt.
    RetriesExhausted,
    /// A non-retryable model error or an unparseable response.
    Failed(String),
    Cancelled,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SkipReason::Timeout => write!(f, "page budget exceeded"),
            SkipReason::RetriesExhausted => write!(f, "retries exhausted"),
            SkipReason::Failed(msg) => write!(f, "{msg}"),
            SkipReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageState {
    Pending,
    /// Waiting to make attempt number `attempt` (0-based) after a rate limit.
    Retrying { attempt: u32 },
    Succeeded(Vec<Fields>),
    Skipped(SkipReason),
}

impl PageState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PageState::Succeeded(_) | PageState::Skipped(_))
    }
}

/// Retry state for one page.
#[derive(Debug)]
pub struct PageMachine {
    policy: RetryPolicy,
    state: PageState,
    attempt: u32,
    backoffs: Vec<Duration>,
}

impl PageMachine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: PageState::Pending,
            attempt: 0,
            backoffs: Vec::new(),
        }
    }

    pub fn state(&self) -> &PageState {
        &self.state
    }

    /// Number of model calls started so far.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Sleeps requested so far, in order.
    pub fn backoffs(&self) -> &[Duration] {
        &self.backoffs
    }

    /// Gate before a model call. Returns `false` once the page is terminal,
    /// including when the budget or the attempt limit has run out.
    pub fn begin_attempt(&mut self, elapsed: Duration) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if self.attempt >= self.policy.max_retries {
            self.state = PageState::Skipped(SkipReason::RetriesExhausted);
            return false;
        }
        if elapsed > self.policy.max_wait {
            self.state = PageState::Skipped(SkipReason::Timeout);
            return false;
        }
        true
    }

    /// Apply the outcome of a model call. Returns how long to sleep before the
    /// next attempt, or `None` when no sleep is needed.
    pub fn on_result(&mut self, result: Result<String, ExtractError>) -> Option<Duration> {
        let attempt = self.attempt;
        self.attempt += 1;

        match result {
            Ok(text) if text.trim().is_empty() => {
                self.state = PageState::Retrying {
                    attempt: self.attempt,
                };
                None
            }
            Ok(text) => {
                self.state = match parse_records(&text) {
                    Ok(records) => PageState::Succeeded(records),
                    Err(e) => PageState::Skipped(SkipReason::Failed(format!(
                        "unparseable response: {e}"
                    ))),
                };
                None
            }
            Err(ExtractError::RateLimited { retry_after }) => {
                if self.attempt >= self.policy.max_retries {
                    self.state = PageState::Skipped(SkipReason::RetriesExhausted);
                    return None;
                }
                let mut wait = self.policy.backoff(attempt);
                if let Some(hint) = retry_after {
                    wait = wait.max(hint);
                }
                self.backoffs.push(wait);
                self.state = PageState::Retrying {
                    attempt: self.attempt,
                };
                Some(wait)
            }
            Err(ExtractError::Other(msg)) => {
                self.state = PageState::Skipped(SkipReason::Failed(msg));
                None
            }
        }
    }

    /// A model call outlived the page budget.
    pub fn time_out(&mut self) {
        self.state = PageState::Skipped(SkipReason::Timeout);
    }

    pub fn cancel(&mut self) {
        self.state = PageState::Skipped(SkipReason::Cancelled);
    }
}

/// Result of extracting one page. Never an error: failures become skips.
#[derive(Debug, Clone, PartialEq)]
pub struct PageOutcome {
    pub page_number: usize,
    pub records: Vec<Fields>,
    pub skipped: Option<SkipReason>,
    pub attempts: u32,
    pub backoffs: Vec<Duration>,
}

impl PageOutcome {
    pub fn skipped(&self) -> bool {
        self.skipped.is_some()
    }
}

/// Runs a [`PageMachine`] against a live extractor.
#[derive(Clone)]
pub struct PageExtractor {
    extractor: Arc<dyn FieldExtractor>,
    policy: RetryPolicy,
}

impl PageExtractor {
    pub fn new(extractor: Arc<dyn FieldExtractor>, policy: RetryPolicy) -> Self {
        Self { extractor, policy }
    }

    pub async fn extract(
        &self,
        image: &PageImage,
        instructions: &str,
        cancel: &CancellationToken,
    ) -> PageOutcome {
        let start = Instant::now();
        let mut machine = PageMachine::new(self.policy);

        while machine.begin_attempt(start.elapsed()) {
            let remaining = self.policy.max_wait.saturating_sub(start.elapsed());
            let call = tokio::time::timeout(remaining, self.extractor.extract(image, instructions));

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    machine.cancel();
                    break;
                }
                r = call => r,
            };

            let Ok(result) = result else {
                machine.time_out();
                break;
            };

            if let Err(ExtractError::Other(ref msg)) = result {
                tracing::warn!(page = image.number, error = %msg, "model call failed");
            }

            if let Some(wait) = machine.on_result(result) {
                let remaining = self.policy.max_wait.saturating_sub(start.elapsed());
                if wait >= remaining {
                    // The next attempt could not start inside the budget.
                    tracing::info!(
                        page = image.number,
                        attempt = machine.attempts(),
                        backoff_secs = wait.as_secs_f64(),
                        remaining_secs = remaining.as_secs_f64(),
                        "backoff exceeds page budget"
                    );
                    machine.time_out();
                    break;
                }
                tracing::info!(
                    page = image.number,
                    attempt = machine.attempts(),
                    backoff_secs = wait.as_secs_f64(),
                    "rate limited, backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        machine.cancel();
                        break;
                    }
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }

        debug_assert!(
            machine.state.is_terminal(),
            "page loop exited in state {:?}",
            machine.state
        );
        let attempts = machine.attempts();
        let backoffs = machine.backoffs().to_vec();
        let (records, skipped) = match machine.state {
            PageState::Succeeded(records) => (records, None),
            PageState::Skipped(reason) => {
                tracing::warn!(page = image.number, reason = %reason, "page skipped");
                (Vec::new(), Some(reason))
            }
            state @ (PageState::Pending | PageState::Retrying { .. }) => {
                tracing::warn!(
                    page = image.number,
                    state = ?state,
                    "page loop exited without a terminal state"
                );
                (Vec::new(), Some(SkipReason::Timeout))
            }
        };

        PageOutcome {
            page_number: image.number,
            records,
            skipped,
            attempts,
            backoffs,
        }
    }
}

/// Parse model output into rows. Accepts raw JSON or JSON wrapped in a
/// fenced code block. An array yields one row per element (non-object
/// elements become `{"value": ..}`), an object yields one row and `null`
/// yields none.
pub fn parse_records(text: &str) -> Result<Vec<Fields>, serde_json::Error> {
    let payload = strip_fences(text);
    let value: Value = serde_json::from_str(payload)?;
    Ok(match value {
        Value::Null => Vec::new(),
        Value::Array(items) => items.into_iter().map(into_fields).collect(),
        other => vec![into_fields(other)],
    })
}

fn into_fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("value".into(), other);
            map
        }
    }
}

fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(open) = trimmed.find("```") else {
        return trimmed;
    };
    let after = &trimmed[open + 3..];
    // Drop the language tag line, if any.
    let body = match after.find('\n') {
        Some(nl) => &after[nl + 1..],
        None => after.trim_start_matches("json"),
    };
    match body.rfind("```") {
        Some(close) => body[..close].trim(),
        None => body.trim(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::mock::{MockExtractor, MockResponse};
    use serde_json::json;

    fn rate_limited() -> Result<String, ExtractError> {
        Err(ExtractError::RateLimited { retry_after: None })
    }

    fn image(key: &str, number: usize) -> PageImage {
        PageImage {
            number,
            png: key.as_bytes().to_vec(),
        }
    }

    // ── parse_records ──────────────────────────────────────────────────

    #[test]
    fn parses_fenced_array() {
        let text = "```json\n[{\"item\": \"bolt\", \"qty\": 4}, {\"item\": \"nut\"}]\n```";
        let rows = parse_records(text).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["qty"], json!(4));
    }

    #[test]
    fn parses_raw_object_and_null() {
        assert_eq!(parse_records(r#"{"a": 1}"#).unwrap().len(), 1);
        assert!(parse_records("null").unwrap().is_empty());
    }

    #[test]
    fn wraps_scalars() {
        let rows = parse_records("[1, \"two\"]").unwrap();
        assert_eq!(rows[1]["value"], json!("two"));
    }

    #[test]
    fn fence_with_leading_prose() {
        let text = "Here you go:\n```\n[{\"a\": 1}]\n```\n";
        assert_eq!(parse_records(text).unwrap().len(), 1);
    }

    #[test]
    fn garbage_is_error() {
        assert!(parse_records("not json").is_err());
    }

    // ── PageMachine ────────────────────────────────────────────────────

    #[test]
    fn machine_success_first_try() {
        let mut m = PageMachine::new(RetryPolicy::default());
        assert_eq!(m.state(), &PageState::Pending);
        assert!(m.begin_attempt(Duration::ZERO));
        assert_eq!(m.on_result(Ok("[{\"a\":1}]".into())), None);
        assert!(matches!(m.state(), PageState::Succeeded(rows) if rows.len() == 1));
        assert!(!m.begin_attempt(Duration::ZERO));
        assert_eq!(m.attempts(), 1);
    }

    #[test]
    fn machine_backs_off_exponentially() {
        let mut m = PageMachine::new(RetryPolicy::default());
        assert!(m.begin_attempt(Duration::ZERO));
        assert_eq!(m.on_result(rate_limited()), Some(Duration::from_secs(1)));
        assert_eq!(m.state(), &PageState::Retrying { attempt: 1 });
        assert!(m.begin_attempt(Duration::from_secs(1)));
        assert_eq!(m.on_result(rate_limited()), Some(Duration::from_secs(2)));
        assert!(m.begin_attempt(Duration::from_secs(3)));
        assert_eq!(m.on_result(rate_limited()), Some(Duration::from_secs(4)));
        assert_eq!(m.backoffs().len(), 3);
    }

    #[test]
    fn machine_honors_longer_retry_after() {
        let mut m = PageMachine::new(RetryPolicy::default());
        assert!(m.begin_attempt(Duration::ZERO));
        let wait = m.on_result(Err(ExtractError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        }));
        assert_eq!(wait, Some(Duration::from_secs(7)));
    }

    #[test]
    fn machine_times_out_past_budget() {
        let mut m = PageMachine::new(RetryPolicy::default());
        assert!(m.begin_attempt(Duration::ZERO));
        m.on_result(rate_limited());
        assert!(m.begin_attempt(Duration::from_secs(30)));
        m.on_result(rate_limited());
        assert!(!m.begin_attempt(Duration::from_millis(30_001)));
        assert_eq!(m.state(), &PageState::Skipped(SkipReason::Timeout));
    }

    #[test]
    fn machine_exhausts_retries() {
        let policy = RetryPolicy {
            max_retries: 2,
            ..RetryPolicy::default()
        };
        let mut m = PageMachine::new(policy);
        assert!(m.begin_attempt(Duration::ZERO));
        assert!(m.on_result(rate_limited()).is_some());
        assert!(m.begin_attempt(Duration::ZERO));
        // Last allowed attempt: no pointless sleep before giving up
        assert_eq!(m.on_result(rate_limited()), None);
        assert_eq!(m.state(), &PageState::Skipped(SkipReason::RetriesExhausted));
        assert!(!m.begin_attempt(Duration::ZERO));
    }

    #[test]
    fn machine_other_error_skips() {
        let mut m = PageMachine::new(RetryPolicy::default());
        assert!(m.begin_attempt(Duration::ZERO));
        assert_eq!(m.on_result(Err(ExtractError::Other("400 bad".into()))), None);
        assert_eq!(
            m.state(),
            &PageState::Skipped(SkipReason::Failed("400 bad".into()))
        );
    }

    #[test]
    fn machine_empty_response_retries_without_sleep() {
        let mut m = PageMachine::new(RetryPolicy::default());
        assert!(m.begin_attempt(Duration::ZERO));
        assert_eq!(m.on_result(Ok("  ".into())), None);
        assert_eq!(m.state(), &PageState::Retrying { attempt: 1 });
        assert!(m.begin_attempt(Duration::ZERO));
    }

    #[test]
    fn machine_unparseable_skips() {
        let mut m = PageMachine::new(RetryPolicy::default());
        assert!(m.begin_attempt(Duration::ZERO));
        m.on_result(Ok("{{{".into()));
        assert!(matches!(m.state(), PageState::Skipped(SkipReason::Failed(_))));
    }

    // ── PageExtractor ──────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn retries_twice_then_succeeds() {
        let mock = MockExtractor::new(MockResponse::Records(json!([{"a": 1}]))).with_script(
            "d:2",
            vec![
                MockResponse::RateLimited { retry_after: None },
                MockResponse::RateLimited { retry_after: None },
                MockResponse::Records(json!([{"a": 1}, {"a": 2}])),
            ],
        );
        let mock = Arc::new(mock);
        let pages = PageExtractor::new(mock.clone(), RetryPolicy::default());

        let start = Instant::now();
        let outcome = pages
            .extract(&image("d:2", 2), "fields", &CancellationToken::new())
            .await;

        assert!(!outcome.skipped());
        assert_eq!(outcome.records.len(), 2);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            outcome.backoffs,
            vec![Duration::from_secs(1), Duration::from_secs(2)]
        );
        assert_eq!(mock.calls_for("d:2"), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn continuous_rate_limit_skips_after_budget() {
        let mock = Arc::new(MockExtractor::new(MockResponse::RateLimited {
            retry_after: None,
        }));
        let pages = PageExtractor::new(mock.clone(), RetryPolicy::default());

        let start = Instant::now();
        let outcome = pages
            .extract(&image("d:1", 1), "fields", &CancellationToken::new())
            .await;

        assert_eq!(outcome.skipped, Some(SkipReason::Timeout));
        assert!(outcome.records.is_empty());
        // Calls at t = 0, 1, 3, 7, 15; the next 16s backoff would end past 30s.
        assert_eq!(mock.call_count(), 5);
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn long_retry_after_does_not_outlast_budget() {
        let mock = Arc::new(MockExtractor::new(MockResponse::RateLimited {
            retry_after: Some(Duration::from_secs(3600)),
        }));
        let policy = RetryPolicy::default();
        let pages = PageExtractor::new(mock.clone(), policy);

        let start = Instant::now();
        let outcome = pages
            .extract(&image("d:1", 1), "fields", &CancellationToken::new())
            .await;

        assert!(start.elapsed() <= policy.max_wait);
        assert_eq!(outcome.skipped, Some(SkipReason::Timeout));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_within_budget_is_honored() {
        let mock = MockExtractor::new(MockResponse::Records(json!([{"a": 1}]))).with_script(
            "d:1",
            vec![MockResponse::RateLimited {
                retry_after: Some(Duration::from_secs(12)),
            }],
        );
        let pages = PageExtractor::new(Arc::new(mock), RetryPolicy::default());

        let start = Instant::now();
        let outcome = pages
            .extract(&image("d:1", 1), "fields", &CancellationToken::new())
            .await;

        assert!(!outcome.skipped());
        assert_eq!(start.elapsed(), Duration::from_secs(12));
    }

    #[tokio::test(start_paused = true)]
    async fn hanging_call_is_cut_at_budget() {
        let mock = Arc::new(MockExtractor::new(MockResponse::Hang));
        let pages = PageExtractor::new(mock, RetryPolicy::default());

        let start = Instant::now();
        let outcome = pages
            .extract(&image("d:1", 1), "fields", &CancellationToken::new())
            .await;

        assert_eq!(outcome.skipped, Some(SkipReason::Timeout));
        assert_eq!(start.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let mock = Arc::new(MockExtractor::new(MockResponse::RateLimited {
            retry_after: Some(Duration::from_secs(20)),
        }));
        let pages = PageExtractor::new(mock.clone(), RetryPolicy::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            trigger.cancel();
        });

        let outcome = pages.extract(&image("d:1", 1), "fields", &cancel).await;
        assert_eq!(outcome.skipped, Some(SkipReason::Cancelled));
        assert_eq!(mock.call_count(), 1);
    }

    #[tokio::test]
    async fn non_retryable_error_skips_immediately() {
        let mock = Arc::new(MockExtractor::new(MockResponse::Error("invalid image".into())));
        let pages = PageExtractor::new(mock.clone(), RetryPolicy::default());

        let outcome = pages
            .extract(&image("d:1", 1), "fields", &CancellationToken::new())
            .await;
        assert_eq!(
            outcome.skipped,
            Some(SkipReason::Failed("invalid image".into()))
        );
        assert_eq!(mock.call_count(), 1);
    }
}
